use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{Asset, AssetKind, AssetStatus, ClaimedAsset};

/// After this many claim attempts a failing asset is poisoned instead of
/// being returned to the queue.
pub const MAX_RETRIES: i32 = 5;

const ASSET_COLUMNS: &str = "id, library_id, rel_path, kind, mtime, size, status, claimed_from, \
     tags_model_id, analysis_model_id, visual_analysis, error_message, worker_id, \
     lease_expires_at, retry_count, video_preview_path, segmentation_version";

/// Scanner upsert with dirty detection. A row whose mtime or size changed is
/// sent back to `pending` with its derived model references cleared; an
/// unchanged row is left exactly as it was. This is the only path that
/// re-queues a completed asset.
pub async fn upsert_from_scan(
    pool: &PgPool,
    library_id: &str,
    rel_path: &str,
    kind: AssetKind,
    mtime: f64,
    size: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO asset (library_id, rel_path, kind, mtime, size, status, retry_count)
         VALUES ($1, $2, $3, $4, $5, 'pending', 0)
         ON CONFLICT (library_id, rel_path) DO UPDATE SET
             kind = EXCLUDED.kind,
             mtime = EXCLUDED.mtime,
             size = EXCLUDED.size,
             status = CASE
                 WHEN asset.mtime IS DISTINCT FROM EXCLUDED.mtime
                      OR asset.size IS DISTINCT FROM EXCLUDED.size
                 THEN 'pending'
                 ELSE asset.status
             END,
             tags_model_id = CASE
                 WHEN asset.mtime IS DISTINCT FROM EXCLUDED.mtime
                      OR asset.size IS DISTINCT FROM EXCLUDED.size
                 THEN NULL
                 ELSE asset.tags_model_id
             END,
             analysis_model_id = CASE
                 WHEN asset.mtime IS DISTINCT FROM EXCLUDED.mtime
                      OR asset.size IS DISTINCT FROM EXCLUDED.size
                 THEN NULL
                 ELSE asset.analysis_model_id
             END,
             visual_analysis = CASE
                 WHEN asset.mtime IS DISTINCT FROM EXCLUDED.mtime
                      OR asset.size IS DISTINCT FROM EXCLUDED.size
                 THEN NULL
                 ELSE asset.visual_analysis
             END",
    )
    .bind(library_id)
    .bind(rel_path)
    .bind(kind.as_str())
    .bind(mtime)
    .bind(size)
    .execute(pool)
    .await?;
    Ok(())
}

/// Predicate for one claim attempt.
#[derive(Clone, Debug)]
pub struct ClaimFilter {
    pub statuses: Vec<AssetStatus>,
    pub kind: AssetKind,
    pub library: Option<String>,
    /// Worker model id; when set the asset's effective target model
    /// (library override, else system default) must match.
    pub worker_model_id: Option<i64>,
    pub system_default_model_id: Option<i64>,
    /// AI video stages only want assets that already have scene rows.
    pub require_scenes: bool,
}

impl ClaimFilter {
    pub fn new(kind: AssetKind, statuses: &[AssetStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            kind,
            library: None,
            worker_model_id: None,
            system_default_model_id: None,
            require_scenes: false,
        }
    }
}

/// Atomically claim one eligible asset: select with FOR UPDATE SKIP LOCKED
/// and flip it to `processing` in the same transaction. Concurrent claimants
/// skip each other's locked rows, so no asset is ever handed out twice.
pub async fn claim(
    pool: &PgPool,
    worker_id: &str,
    filter: &ClaimFilter,
    lease_ttl_secs: i64,
) -> Result<Option<ClaimedAsset>> {
    let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().into()).collect();
    let scenes_clause = if filter.require_scenes {
        " AND EXISTS (SELECT 1 FROM video_scene vs WHERE vs.asset_id = a.id)"
    } else {
        ""
    };
    let sql = format!(
        "SELECT a.id, a.library_id, a.rel_path, a.kind, a.retry_count, a.tags_model_id,
                a.analysis_model_id, a.segmentation_version, a.status AS pre_claim_status,
                l.absolute_path AS library_root
         FROM asset a
         JOIN library l ON l.slug = a.library_id
         WHERE a.status = ANY($1)
           AND a.kind = $2
           AND l.is_active AND l.deleted_at IS NULL
           AND ($3::text IS NULL OR a.library_id = $3)
           AND ($4::bigint IS NULL OR COALESCE(l.target_model_id, $5) = $4)
           AND (a.status <> 'failed' OR a.retry_count <= $6){scenes_clause}
         ORDER BY a.id
         FOR UPDATE OF a SKIP LOCKED
         LIMIT 1"
    );

    let mut tx = pool.begin().await?;
    let row: Option<PgRow> = sqlx::query(&sql)
        .bind(&statuses)
        .bind(filter.kind.as_str())
        .bind(filter.library.as_deref())
        .bind(filter.worker_model_id)
        .bind(filter.system_default_model_id)
        .bind(MAX_RETRIES)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let id: i64 = row.try_get("id")?;
    let pre_claim_status: String = row.try_get("pre_claim_status")?;
    let retry_count: i32 = sqlx::query_scalar(
        "UPDATE asset
         SET status = 'processing',
             claimed_from = $2,
             worker_id = $3,
             lease_expires_at = NOW() + make_interval(secs => $4),
             retry_count = retry_count + 1,
             error_message = NULL
         WHERE id = $1
         RETURNING retry_count",
    )
    .bind(id)
    .bind(&pre_claim_status)
    .bind(worker_id)
    .bind(lease_ttl_secs as f64)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    let kind: String = row.try_get("kind")?;
    Ok(Some(ClaimedAsset {
        id,
        library_id: row.try_get("library_id")?,
        rel_path: row.try_get("rel_path")?,
        kind: AssetKind::try_from(kind)?,
        retry_count,
        tags_model_id: row.try_get("tags_model_id")?,
        analysis_model_id: row.try_get("analysis_model_id")?,
        segmentation_version: row.try_get("segmentation_version")?,
        claimed_from: Some(pre_claim_status),
        library_root: row.try_get("library_root")?,
    }))
}

pub async fn renew_lease(pool: &PgPool, asset_id: i64, lease_ttl_secs: i64) -> Result<()> {
    sqlx::query(
        "UPDATE asset SET lease_expires_at = NOW() + make_interval(secs => $2) WHERE id = $1",
    )
    .bind(asset_id)
    .bind(lease_ttl_secs as f64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Sweep `processing` rows whose lease has expired. Within the retry budget
/// the row returns to its pre-claim status; beyond it, it is poisoned.
/// Lease expiry, not the heartbeat, is what decides abandonment.
pub async fn reclaim_expired(pool: &PgPool, library: Option<&str>) -> Result<u64> {
    let reclaimed = sqlx::query(
        "UPDATE asset
         SET status = CASE WHEN retry_count <= $1
                 THEN COALESCE(claimed_from, 'pending')
                 ELSE 'poisoned' END,
             error_message = CASE WHEN retry_count <= $1
                 THEN error_message
                 ELSE COALESCE(error_message, 'lease expired; retry limit exceeded') END,
             lease_expires_at = NULL,
             claimed_from = NULL
         WHERE status = 'processing'
           AND lease_expires_at < NOW()
           AND ($2::text IS NULL OR library_id = $2)",
    )
    .bind(MAX_RETRIES)
    .bind(library)
    .execute(pool)
    .await?
    .rows_affected();
    if reclaimed > 0 {
        info!(reclaimed, "reclaimed expired leases");
    }
    Ok(reclaimed)
}

/// How many `processing` rows currently hold an expired lease (dry-run
/// preview of the reclaim sweep).
pub async fn count_expired_leases(pool: &PgPool, library: Option<&str>) -> Result<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM asset
         WHERE status = 'processing'
           AND lease_expires_at < NOW()
           AND ($1::text IS NULL OR library_id = $1)",
    )
    .bind(library)
    .fetch_one(pool)
    .await?)
}

/// Forward transition after a stage finished its work. Resets the retry
/// budget and releases the lease.
pub async fn mark_succeeded(pool: &PgPool, asset_id: i64, status: AssetStatus) -> Result<()> {
    debug_assert!(matches!(
        status,
        AssetStatus::Proxied | AssetStatus::AnalyzedLight | AssetStatus::Completed
    ));
    sqlx::query(
        "UPDATE asset
         SET status = $2, retry_count = 0, error_message = NULL,
             lease_expires_at = NULL, claimed_from = NULL
         WHERE id = $1",
    )
    .bind(asset_id)
    .bind(status.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a failed attempt. Retryable errors send the asset to `failed`
/// until the retry budget runs out; everything past the cap (and anything
/// the caller already knows is permanent) is poisoned.
pub async fn mark_failed(
    pool: &PgPool,
    asset_id: i64,
    retry_count: i32,
    error: &str,
    permanent: bool,
) -> Result<AssetStatus> {
    let (status, message) = if permanent {
        (AssetStatus::Poisoned, error.to_string())
    } else if retry_count > MAX_RETRIES {
        (
            AssetStatus::Poisoned,
            format!("{error}\n\nretry limit exceeded (retry_count={retry_count} > {MAX_RETRIES})"),
        )
    } else {
        (AssetStatus::Failed, error.to_string())
    };
    if status == AssetStatus::Poisoned {
        warn!(asset_id, "poisoning asset: {message}");
    }
    sqlx::query(
        "UPDATE asset
         SET status = $2, error_message = $3, lease_expires_at = NULL, claimed_from = NULL
         WHERE id = $1",
    )
    .bind(asset_id)
    .bind(status.as_str())
    .bind(&message)
    .execute(pool)
    .await?;
    Ok(status)
}

/// Release a claim without recording an outcome (graceful shutdown): the
/// asset goes back to whatever status it was claimed from and the retry
/// spent on this attempt is returned.
pub async fn release_claim(pool: &PgPool, asset_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE asset
         SET status = COALESCE(claimed_from, 'pending'),
             claimed_from = NULL,
             lease_expires_at = NULL,
             retry_count = GREATEST(retry_count - 1, 0)
         WHERE id = $1 AND status = 'processing'",
    )
    .bind(asset_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_video_preview_path(pool: &PgPool, asset_id: i64, rel_path: &str) -> Result<()> {
    sqlx::query("UPDATE asset SET video_preview_path = $2 WHERE id = $1")
        .bind(asset_id)
        .bind(rel_path)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_segmentation_version(pool: &PgPool, asset_id: i64, version: i64) -> Result<()> {
    sqlx::query("UPDATE asset SET segmentation_version = $2 WHERE id = $1")
        .bind(asset_id)
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_tags_model(pool: &PgPool, asset_id: i64, model_id: i64) -> Result<()> {
    sqlx::query("UPDATE asset SET tags_model_id = $2 WHERE id = $1")
        .bind(asset_id)
        .bind(model_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_analysis_model(pool: &PgPool, asset_id: i64, model_id: i64) -> Result<()> {
    sqlx::query("UPDATE asset SET analysis_model_id = $2 WHERE id = $1")
        .bind(asset_id)
        .bind(model_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_visual_analysis(
    pool: &PgPool,
    asset_id: i64,
    analysis: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE asset SET visual_analysis = $2 WHERE id = $1")
        .bind(asset_id)
        .bind(analysis)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get(pool: &PgPool, asset_id: i64) -> Result<Option<Asset>> {
    let sql = format!("SELECT {ASSET_COLUMNS} FROM asset WHERE id = $1");
    Ok(sqlx::query_as::<_, Asset>(&sql)
        .bind(asset_id)
        .fetch_optional(pool)
        .await?)
}

pub async fn list_for_library(
    pool: &PgPool,
    library: &str,
    status: Option<AssetStatus>,
    limit: i64,
) -> Result<Vec<Asset>> {
    let sql = format!(
        "SELECT {ASSET_COLUMNS} FROM asset
         WHERE library_id = $1 AND ($2::text IS NULL OR status = $2)
         ORDER BY id DESC LIMIT $3"
    );
    Ok(sqlx::query_as::<_, Asset>(&sql)
        .bind(library)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(pool)
        .await?)
}

/// One repair page: assets expected to have derivatives on disk. The repair
/// pass walks these in id order and only ever resets them to `pending`.
pub async fn derivative_expectations(
    pool: &PgPool,
    kind: AssetKind,
    library: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<(i64, String, Option<String>)>> {
    let rows = sqlx::query(
        "SELECT a.id, a.library_id, a.video_preview_path
         FROM asset a
         JOIN library l ON l.slug = a.library_id
         WHERE a.status IN ('proxied', 'analyzed_light', 'completed')
           AND a.kind = $1
           AND l.deleted_at IS NULL
           AND ($2::text IS NULL OR a.library_id = $2)
         ORDER BY a.id
         LIMIT $3 OFFSET $4",
    )
    .bind(kind.as_str())
    .bind(library)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|r| {
            Ok((
                r.try_get::<i64, _>("id")?,
                r.try_get::<String, _>("library_id")?,
                r.try_get::<Option<String>, _>("video_preview_path")?,
            ))
        })
        .collect()
}

/// Repair reset: send an asset back through the proxy stage. Never advances
/// a status.
pub async fn reset_to_pending(pool: &PgPool, asset_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE asset SET status = 'pending'
         WHERE id = $1 AND status IN ('proxied', 'analyzed_light', 'completed', 'failed')",
    )
    .bind(asset_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// AI repair: send assets analyzed with a model other than their library's
/// effective target back to `proxied` for re-analysis. Reset-only.
pub async fn reset_for_reanalysis(
    pool: &PgPool,
    kind: AssetKind,
    library: Option<&str>,
    system_default_model_id: i64,
) -> Result<u64> {
    Ok(sqlx::query(
        "UPDATE asset a SET status = 'proxied'
         FROM library l
         WHERE l.slug = a.library_id
           AND l.deleted_at IS NULL
           AND a.kind = $1
           AND a.status IN ('analyzed_light', 'completed')
           AND ($2::text IS NULL OR a.library_id = $2)
           AND a.tags_model_id IS DISTINCT FROM COALESCE(l.target_model_id, $3)",
    )
    .bind(kind.as_str())
    .bind(library)
    .bind(system_default_model_id)
    .execute(pool)
    .await?
    .rows_affected())
}

/// Operator escape hatch for poisoned assets.
pub async fn retry_poisoned(pool: &PgPool, library: Option<&str>) -> Result<u64> {
    Ok(sqlx::query(
        "UPDATE asset
         SET status = 'pending', retry_count = 0, error_message = NULL, claimed_from = NULL
         WHERE status = 'poisoned' AND ($1::text IS NULL OR library_id = $1)",
    )
    .bind(library)
    .execute(pool)
    .await?
    .rows_affected())
}

pub async fn count_by_status(
    pool: &PgPool,
    library: Option<&str>,
) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM asset
         WHERE ($1::text IS NULL OR library_id = $1)
         GROUP BY status ORDER BY status",
    )
    .bind(library)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|r| Ok((r.try_get::<String, _>("status")?, r.try_get::<i64, _>("n")?)))
        .collect()
}

pub async fn count_claimable(
    pool: &PgPool,
    kind: AssetKind,
    library: Option<&str>,
) -> Result<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM asset
         WHERE kind = $1 AND status IN ('pending', 'failed')
           AND ($2::text IS NULL OR library_id = $2)",
    )
    .bind(kind.as_str())
    .bind(library)
    .fetch_one(pool)
    .await?)
}
