use sqlx::PgPool;

use crate::error::Result;
use crate::model::AiModel;
use crate::vision::ModelCard;

pub const DEFAULT_MODEL_KEY: &str = "default_ai_model_id";

pub async fn get_value(pool: &PgPool, key: &str) -> Result<Option<String>> {
    Ok(
        sqlx::query_scalar("SELECT value FROM system_metadata WHERE key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await?,
    )
}

pub async fn set_value(pool: &PgPool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO system_metadata (key, value) VALUES ($1, $2)
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// The fleet-wide fallback model used when a library has no target override.
pub async fn default_model_id(pool: &PgPool) -> Result<Option<i64>> {
    Ok(get_value(pool, DEFAULT_MODEL_KEY)
        .await?
        .and_then(|v| v.parse().ok()))
}

pub async fn set_default_model_id(pool: &PgPool, model_id: i64) -> Result<()> {
    set_value(pool, DEFAULT_MODEL_KEY, &model_id.to_string()).await
}

/// Look up or register the (name, version) pair for an analyzer.
pub async fn get_or_create_model(pool: &PgPool, card: &ModelCard) -> Result<i64> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM ai_model WHERE name = $1 AND version = $2")
            .bind(&card.name)
            .bind(&card.version)
            .fetch_optional(pool)
            .await?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO ai_model (name, version) VALUES ($1, $2)
         ON CONFLICT (name, version) DO UPDATE SET name = EXCLUDED.name
         RETURNING id",
    )
    .bind(&card.name)
    .bind(&card.version)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn get_model(pool: &PgPool, id: i64) -> Result<Option<AiModel>> {
    Ok(
        sqlx::query_as::<_, AiModel>("SELECT id, name, version FROM ai_model WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?,
    )
}
