use serde_json::Value;
use sqlx::PgPool;

use crate::error::Result;
use crate::model::{SceneCloseReason, VideoActiveState, VideoScene};

const SCENE_COLUMNS: &str = "id, asset_id, start_ts, end_ts, rep_frame_path, sharpness, \
     close_reason, description, metadata";

/// Payload for one closed scene.
#[derive(Clone, Debug)]
pub struct NewScene {
    pub start_ts: f64,
    pub end_ts: f64,
    pub rep_frame_path: String,
    pub sharpness: f64,
    pub close_reason: SceneCloseReason,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

/// The resume state persisted alongside each scene close. `None` means the
/// stream ended and the active-state row must be removed.
#[derive(Clone, Debug)]
pub struct NewActiveState {
    pub anchor_phash: String,
    pub scene_start_ts: f64,
    pub best_pts: f64,
    pub best_sharpness: f64,
}

pub async fn list(pool: &PgPool, asset_id: i64) -> Result<Vec<VideoScene>> {
    let sql = format!(
        "SELECT {SCENE_COLUMNS} FROM video_scene WHERE asset_id = $1 ORDER BY start_ts"
    );
    Ok(sqlx::query_as::<_, VideoScene>(&sql)
        .bind(asset_id)
        .fetch_all(pool)
        .await?)
}

pub async fn get(pool: &PgPool, scene_id: i64) -> Result<Option<VideoScene>> {
    let sql = format!("SELECT {SCENE_COLUMNS} FROM video_scene WHERE id = $1");
    Ok(sqlx::query_as::<_, VideoScene>(&sql)
        .bind(scene_id)
        .fetch_optional(pool)
        .await?)
}

/// Resume anchor: the end of the furthest persisted scene, or None when the
/// asset has never been segmented.
pub async fn max_end_ts(pool: &PgPool, asset_id: i64) -> Result<Option<f64>> {
    Ok(
        sqlx::query_scalar("SELECT MAX(end_ts) FROM video_scene WHERE asset_id = $1")
            .bind(asset_id)
            .fetch_one(pool)
            .await?,
    )
}

pub async fn active_state(pool: &PgPool, asset_id: i64) -> Result<Option<VideoActiveState>> {
    Ok(sqlx::query_as::<_, VideoActiveState>(
        "SELECT asset_id, anchor_phash, scene_start_ts, best_pts, best_sharpness
         FROM video_active_state WHERE asset_id = $1",
    )
    .bind(asset_id)
    .fetch_optional(pool)
    .await?)
}

pub async fn last_description(pool: &PgPool, asset_id: i64) -> Result<Option<String>> {
    let row: Option<Option<String>> = sqlx::query_scalar(
        "SELECT description FROM video_scene
         WHERE asset_id = $1 ORDER BY end_ts DESC LIMIT 1",
    )
    .bind(asset_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.flatten())
}

/// One scene-close transaction: insert the scene, upsert or delete the
/// active-state row, and renew the asset lease, all or nothing. A crash
/// between scene closes therefore always leaves a consistent resume point.
pub async fn save_scene_close(
    pool: &PgPool,
    asset_id: i64,
    scene: &NewScene,
    next_state: Option<&NewActiveState>,
    lease_ttl_secs: i64,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let scene_id: i64 = sqlx::query_scalar(
        "INSERT INTO video_scene
             (asset_id, start_ts, end_ts, rep_frame_path, sharpness, close_reason,
              description, metadata)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING id",
    )
    .bind(asset_id)
    .bind(scene.start_ts)
    .bind(scene.end_ts)
    .bind(&scene.rep_frame_path)
    .bind(scene.sharpness)
    .bind(scene.close_reason.as_str())
    .bind(scene.description.as_deref())
    .bind(scene.metadata.as_ref())
    .fetch_one(&mut *tx)
    .await?;

    match next_state {
        Some(state) => {
            sqlx::query(
                "INSERT INTO video_active_state
                     (asset_id, anchor_phash, scene_start_ts, best_pts, best_sharpness)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (asset_id) DO UPDATE SET
                     anchor_phash = EXCLUDED.anchor_phash,
                     scene_start_ts = EXCLUDED.scene_start_ts,
                     best_pts = EXCLUDED.best_pts,
                     best_sharpness = EXCLUDED.best_sharpness",
            )
            .bind(asset_id)
            .bind(&state.anchor_phash)
            .bind(state.scene_start_ts)
            .bind(state.best_pts)
            .bind(state.best_sharpness)
            .execute(&mut *tx)
            .await?;
        }
        None => {
            sqlx::query("DELETE FROM video_active_state WHERE asset_id = $1")
                .bind(asset_id)
                .execute(&mut *tx)
                .await?;
        }
    }

    sqlx::query(
        "UPDATE asset SET lease_expires_at = NOW() + make_interval(secs => $2) WHERE id = $1",
    )
    .bind(asset_id)
    .bind(lease_ttl_secs as f64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(scene_id)
}

/// State-only update for scene closes that yielded no persistable scene
/// (e.g. a scene too short to have an eligible best frame).
pub async fn upsert_active_state(
    pool: &PgPool,
    asset_id: i64,
    state: &NewActiveState,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO video_active_state
             (asset_id, anchor_phash, scene_start_ts, best_pts, best_sharpness)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (asset_id) DO UPDATE SET
             anchor_phash = EXCLUDED.anchor_phash,
             scene_start_ts = EXCLUDED.scene_start_ts,
             best_pts = EXCLUDED.best_pts,
             best_sharpness = EXCLUDED.best_sharpness",
    )
    .bind(asset_id)
    .bind(&state.anchor_phash)
    .bind(state.scene_start_ts)
    .bind(state.best_pts)
    .bind(state.best_sharpness)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_active_state(pool: &PgPool, asset_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM video_active_state WHERE asset_id = $1")
        .bind(asset_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop every scene and the resume state for an asset (segmentation
/// parameter invalidation, or forced reindex) and clear its preview path.
pub async fn clear_segmentation(pool: &PgPool, asset_id: i64) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM video_scene WHERE asset_id = $1")
        .bind(asset_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM video_active_state WHERE asset_id = $1")
        .bind(asset_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE asset SET video_preview_path = NULL, segmentation_version = NULL WHERE id = $1",
    )
    .bind(asset_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Vision backfill write. Metadata is replaced wholesale; callers re-read
/// the row first per the strict merge policy.
pub async fn update_scene_vision(
    pool: &PgPool,
    scene_id: i64,
    description: Option<&str>,
    metadata: &Value,
) -> Result<()> {
    sqlx::query("UPDATE video_scene SET description = $2, metadata = $3 WHERE id = $1")
        .bind(scene_id)
        .bind(description)
        .bind(metadata)
        .execute(pool)
        .await?;
    Ok(())
}

/// Scene ids the light pass still has to caption.
pub async fn scenes_missing_description(pool: &PgPool, asset_id: i64) -> Result<Vec<i64>> {
    Ok(sqlx::query_scalar(
        "SELECT id FROM video_scene
         WHERE asset_id = $1 AND description IS NULL
         ORDER BY start_ts",
    )
    .bind(asset_id)
    .fetch_all(pool)
    .await?)
}

/// Scene ids the full pass still has to OCR.
pub async fn scenes_missing_ocr(pool: &PgPool, asset_id: i64) -> Result<Vec<i64>> {
    Ok(sqlx::query_scalar(
        "SELECT id FROM video_scene
         WHERE asset_id = $1 AND metadata->'vision'->>'ocr_text' IS NULL
         ORDER BY start_ts",
    )
    .bind(asset_id)
    .fetch_all(pool)
    .await?)
}
