use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;
use crate::error::{MediadexError, Result};

/// Schema generation this build understands. Workers refuse to start against
/// a database reporting anything else.
pub const SCHEMA_VERSION: &str = "1";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
        .map_err(|e| MediadexError::Config(format!("cannot reach database: {e}")))?;
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&pool)
        .await
        .map_err(|e| MediadexError::Config(format!("database health check failed: {e}")))?;
    info!("connected to Postgres");
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| MediadexError::Config(format!("migration failed: {e}")))?;
    Ok(())
}

/// Compare the database schema_version against this build. A mismatch is a
/// configuration error and the caller must exit non-zero.
pub async fn check_schema_version(pool: &PgPool) -> Result<()> {
    let found: Option<String> =
        sqlx::query_scalar("SELECT value FROM system_metadata WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;
    match found.as_deref() {
        Some(SCHEMA_VERSION) => Ok(()),
        Some(other) => Err(MediadexError::Config(format!(
            "schema_version mismatch: database has {other}, this build expects {SCHEMA_VERSION}"
        ))),
        None => Err(MediadexError::Config(
            "system_metadata has no schema_version; run migrations".into(),
        )),
    }
}
