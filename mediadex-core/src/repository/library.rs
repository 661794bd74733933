use chrono::Utc;
use sqlx::PgPool;

use crate::error::{MediadexError, Result};
use crate::model::{Library, ScanStatus};

/// Rows removed per DELETE when emptying a library. Keeps lock hold times
/// short on multi-million-row libraries.
const DELETE_CHUNK: i64 = 5_000;

const LIBRARY_COLUMNS: &str =
    "slug, name, absolute_path, is_active, scan_status, target_model_id, deleted_at";

/// URL-safe slug from a display name: lowercase, non-alphanumeric collapsed
/// to single hyphens.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_hyphen = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "library".into()
    } else {
        slug
    }
}

/// Insert a new library. Fails when the slug collides with any existing row,
/// soft-deleted ones included: a trashed library still owns its slug.
pub async fn add(pool: &PgPool, name: &str, absolute_path: &str) -> Result<String> {
    let slug = slugify(name);
    let mut tx = pool.begin().await?;
    let existing: Option<Option<chrono::DateTime<Utc>>> =
        sqlx::query_scalar("SELECT deleted_at FROM library WHERE slug = $1")
            .bind(&slug)
            .fetch_optional(&mut *tx)
            .await?;
    match existing {
        Some(None) => {
            return Err(MediadexError::Config(format!(
                "an active library with the slug '{slug}' already exists"
            )));
        }
        Some(Some(_)) => {
            return Err(MediadexError::Config(format!(
                "a deleted library with the slug '{slug}' exists in the trash; \
                 restore it or use a different name"
            )));
        }
        None => {}
    }
    sqlx::query(
        "INSERT INTO library (slug, name, absolute_path, is_active, scan_status)
         VALUES ($1, $2, $3, TRUE, 'idle')",
    )
    .bind(&slug)
    .bind(name)
    .bind(absolute_path)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(slug)
}

pub async fn get(pool: &PgPool, slug: &str, include_deleted: bool) -> Result<Option<Library>> {
    let sql = format!(
        "SELECT {LIBRARY_COLUMNS} FROM library WHERE slug = $1{}",
        if include_deleted { "" } else { " AND deleted_at IS NULL" }
    );
    Ok(sqlx::query_as::<_, Library>(&sql)
        .bind(slug)
        .fetch_optional(pool)
        .await?)
}

/// Fetch a library for a CLI command. Missing and trashed libraries get the
/// same user-facing error, with a pointer at `library list`.
pub async fn get_active_or_fail(pool: &PgPool, slug: &str) -> Result<Library> {
    get(pool, slug, false).await?.ok_or_else(|| {
        MediadexError::NotFound(format!(
            "library not found or deleted: '{slug}' (see 'mediadexctl library list')"
        ))
    })
}

pub async fn list(pool: &PgPool, include_deleted: bool) -> Result<Vec<Library>> {
    let sql = format!(
        "SELECT {LIBRARY_COLUMNS} FROM library{} ORDER BY slug",
        if include_deleted { "" } else { " WHERE deleted_at IS NULL" }
    );
    Ok(sqlx::query_as::<_, Library>(&sql).fetch_all(pool).await?)
}

pub async fn list_trashed(pool: &PgPool) -> Result<Vec<Library>> {
    let sql = format!(
        "SELECT {LIBRARY_COLUMNS} FROM library WHERE deleted_at IS NOT NULL ORDER BY slug"
    );
    Ok(sqlx::query_as::<_, Library>(&sql).fetch_all(pool).await?)
}

pub async fn soft_delete(pool: &PgPool, slug: &str) -> Result<()> {
    let updated = sqlx::query("UPDATE library SET deleted_at = NOW() WHERE slug = $1 AND deleted_at IS NULL")
        .bind(slug)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(MediadexError::NotFound(format!(
            "library not found or deleted: '{slug}' (see 'mediadexctl library list')"
        )));
    }
    Ok(())
}

pub async fn restore(pool: &PgPool, slug: &str) -> Result<()> {
    let updated = sqlx::query("UPDATE library SET deleted_at = NULL WHERE slug = $1 AND deleted_at IS NOT NULL")
        .bind(slug)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(MediadexError::NotFound(format!(
            "no trashed library with slug '{slug}' (see 'mediadexctl library list --include-deleted')"
        )));
    }
    Ok(())
}

pub async fn request_scan(pool: &PgPool, slug: &str) -> Result<()> {
    sqlx::query("UPDATE library SET scan_status = 'scan_requested' WHERE slug = $1")
        .bind(slug)
        .execute(pool)
        .await?;
    Ok(())
}

/// Claim one library awaiting a scan. SKIP LOCKED keeps two scanners from
/// walking the same library concurrently.
pub async fn claim_for_scan(pool: &PgPool, slug: Option<&str>) -> Result<Option<Library>> {
    let mut tx = pool.begin().await?;
    let sql = format!(
        "SELECT {LIBRARY_COLUMNS} FROM library
         WHERE is_active AND deleted_at IS NULL
           AND scan_status = 'scan_requested'
           AND ($1::text IS NULL OR slug = $1)
         ORDER BY slug
         FOR UPDATE SKIP LOCKED
         LIMIT 1"
    );
    let library = sqlx::query_as::<_, Library>(&sql)
        .bind(slug)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(mut library) = library else {
        return Ok(None);
    };
    sqlx::query("UPDATE library SET scan_status = 'scanning' WHERE slug = $1")
        .bind(&library.slug)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    library.scan_status = ScanStatus::Scanning;
    Ok(Some(library))
}

pub async fn set_scan_status(pool: &PgPool, slug: &str, status: ScanStatus) -> Result<()> {
    sqlx::query("UPDATE library SET scan_status = $1 WHERE slug = $2")
        .bind(status.as_str())
        .bind(slug)
        .execute(pool)
        .await?;
    Ok(())
}

/// Permanently delete a trashed library and everything under it. Child rows
/// go first, then assets in chunks so no single statement holds millions of
/// row locks, then the library row.
pub async fn empty_trashed(pool: &PgPool, slug: &str) -> Result<u64> {
    let row: Option<Option<chrono::DateTime<Utc>>> =
        sqlx::query_scalar("SELECT deleted_at FROM library WHERE slug = $1")
            .bind(slug)
            .fetch_optional(pool)
            .await?;
    match row {
        None => {
            return Err(MediadexError::NotFound(format!(
                "library not found: '{slug}' (see 'mediadexctl library list')"
            )))
        }
        Some(None) => {
            return Err(MediadexError::Config(format!(
                "library '{slug}' is not in the trash; soft-delete it first"
            )))
        }
        Some(Some(_)) => {}
    }

    sqlx::query(
        "DELETE FROM video_scene WHERE asset_id IN (SELECT id FROM asset WHERE library_id = $1)",
    )
    .bind(slug)
    .execute(pool)
    .await?;
    sqlx::query(
        "DELETE FROM video_active_state
         WHERE asset_id IN (SELECT id FROM asset WHERE library_id = $1)",
    )
    .bind(slug)
    .execute(pool)
    .await?;

    let mut total = 0u64;
    loop {
        let deleted = sqlx::query(
            "DELETE FROM asset
             WHERE id IN (SELECT id FROM asset WHERE library_id = $1 LIMIT $2)",
        )
        .bind(slug)
        .bind(DELETE_CHUNK)
        .execute(pool)
        .await?
        .rows_affected();
        total += deleted;
        if deleted == 0 {
            break;
        }
    }

    sqlx::query("DELETE FROM library WHERE slug = $1")
        .bind(slug)
        .execute(pool)
        .await?;
    Ok(total)
}
