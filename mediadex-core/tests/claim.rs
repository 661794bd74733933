use std::collections::HashSet;

use sqlx::PgPool;

use mediadex_core::model::{AssetKind, AssetStatus};
use mediadex_core::repository::asset::{self, ClaimFilter};
use mediadex_core::stage::ai::{AiImageStage, AiVideoStage, AnalysisMode};
use mediadex_core::vision::MockAnalyzer;

async fn seed_library(pool: &PgPool, slug: &str) {
    sqlx::query(
        "INSERT INTO library (slug, name, absolute_path, is_active, scan_status)
         VALUES ($1, $1, '/srv/media', TRUE, 'idle')",
    )
    .bind(slug)
    .execute(pool)
    .await
    .expect("seed library");
}

async fn seed_asset(pool: &PgPool, library: &str, rel_path: &str, kind: AssetKind) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO asset (library_id, rel_path, kind, mtime, size, status)
         VALUES ($1, $2, $3, 1000.0, 100, 'pending') RETURNING id",
    )
    .bind(library)
    .bind(rel_path)
    .bind(kind.as_str())
    .fetch_one(pool)
    .await
    .expect("seed asset")
}

async fn asset_status(pool: &PgPool, id: i64) -> String {
    sqlx::query_scalar("SELECT status FROM asset WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("asset status")
}

fn image_filter() -> ClaimFilter {
    ClaimFilter::new(AssetKind::Image, &[AssetStatus::Pending, AssetStatus::Failed])
}

#[sqlx::test]
async fn claim_sets_lease_and_increments_retry(pool: PgPool) {
    seed_library(&pool, "lib").await;
    let id = seed_asset(&pool, "lib", "a.jpg", AssetKind::Image).await;

    let claimed = asset::claim(&pool, "image-proxy-host-000001", &image_filter(), 300)
        .await
        .expect("claim")
        .expect("one asset eligible");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.retry_count, 1);
    assert_eq!(claimed.claimed_from.as_deref(), Some("pending"));
    assert_eq!(claimed.library_root, "/srv/media");

    let (status, worker_id, lease_ok): (String, Option<String>, bool) = sqlx::query_as(
        "SELECT status, worker_id, lease_expires_at > NOW() FROM asset WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await
    .expect("row");
    assert_eq!(status, "processing");
    assert_eq!(worker_id.as_deref(), Some("image-proxy-host-000001"));
    assert!(lease_ok, "lease must be in the future");

    // Nothing else eligible: the same row is never handed out twice.
    let again = asset::claim(&pool, "image-proxy-host-000002", &image_filter(), 300)
        .await
        .expect("claim");
    assert!(again.is_none());
}

#[sqlx::test]
async fn concurrent_claims_partition_the_pool(pool: PgPool) {
    seed_library(&pool, "lib").await;
    for i in 0..100 {
        seed_asset(&pool, "lib", &format!("img_{i:03}.jpg"), AssetKind::Image).await;
    }

    let mut handles = Vec::new();
    for worker in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("image-proxy-host-{worker:06x}");
            let mut claimed = Vec::new();
            loop {
                match asset::claim(&pool, &worker_id, &image_filter(), 300)
                    .await
                    .expect("claim")
                {
                    Some(asset) => claimed.push(asset.id),
                    None => break,
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.expect("worker task"));
    }
    let distinct: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(all.len(), 100, "every asset claimed exactly once");
    assert_eq!(distinct.len(), 100, "no asset claimed twice");

    let processing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM asset WHERE status = 'processing'")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(processing, 100);
    let workers: i64 =
        sqlx::query_scalar("SELECT COUNT(DISTINCT worker_id) FROM asset WHERE worker_id IS NOT NULL")
            .fetch_one(&pool)
            .await
            .expect("count workers");
    assert!(workers >= 1, "claims recorded worker ids");
}

#[sqlx::test]
async fn expired_lease_is_reclaimed_to_pre_claim_status(pool: PgPool) {
    seed_library(&pool, "lib").await;
    let id = seed_asset(&pool, "lib", "x.jpg", AssetKind::Image).await;

    let claimed = asset::claim(&pool, "worker-a", &image_filter(), 300)
        .await
        .expect("claim")
        .expect("eligible");
    assert_eq!(claimed.retry_count, 1);

    // Not yet expired: the sweep must not touch it.
    let reclaimed = asset::reclaim_expired(&pool, None).await.expect("sweep");
    assert_eq!(reclaimed, 0);

    // Worker A dies; 6 minutes pass.
    sqlx::query("UPDATE asset SET lease_expires_at = NOW() - INTERVAL '1 minute' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .expect("expire lease");

    let reclaimed = asset::reclaim_expired(&pool, None).await.expect("sweep");
    assert_eq!(reclaimed, 1);
    assert_eq!(asset_status(&pool, id).await, "pending");

    // Worker B picks it straight up; the retry spent on the dead attempt
    // stays counted.
    let reclaimed_asset = asset::claim(&pool, "worker-b", &image_filter(), 300)
        .await
        .expect("claim")
        .expect("eligible again");
    assert_eq!(reclaimed_asset.id, id);
    assert_eq!(reclaimed_asset.retry_count, 2);
}

#[sqlx::test]
async fn reclaim_restores_ai_stage_origin(pool: PgPool) {
    seed_library(&pool, "lib").await;
    let id = seed_asset(&pool, "lib", "x.jpg", AssetKind::Image).await;
    sqlx::query("UPDATE asset SET status = 'proxied' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .expect("advance");

    // The filter the shipped image AI worker actually claims with.
    let stage = AiImageStage::new(None, AnalysisMode::Light, false, false, Box::new(MockAnalyzer));
    let filter = stage.claim_filter();
    asset::claim(&pool, "ai-image-host-1", &filter, 300)
        .await
        .expect("claim")
        .expect("eligible");
    sqlx::query("UPDATE asset SET lease_expires_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .expect("expire");
    asset::reclaim_expired(&pool, None).await.expect("sweep");
    assert_eq!(asset_status(&pool, id).await, "proxied");
}

#[sqlx::test]
async fn ai_image_failure_is_repicked_by_the_same_stage(pool: PgPool) {
    seed_library(&pool, "lib").await;
    let id = seed_asset(&pool, "lib", "x.jpg", AssetKind::Image).await;
    sqlx::query("UPDATE asset SET status = 'proxied' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .expect("advance");

    let stage = AiImageStage::new(None, AnalysisMode::Light, false, false, Box::new(MockAnalyzer));
    let filter = stage.claim_filter();
    let claimed = asset::claim(&pool, "ai-image-host-1", &filter, 300)
        .await
        .expect("claim")
        .expect("eligible");
    asset::mark_failed(&pool, id, claimed.retry_count, "vision backend unreachable", false)
        .await
        .expect("mark failed");
    assert_eq!(asset_status(&pool, id).await, "failed");

    // The same stage's own predicate picks the failure back up; it is not
    // left for the proxy stage to redo derivatives.
    let again = asset::claim(&pool, "ai-image-host-2", &filter, 300)
        .await
        .expect("claim")
        .expect("failed asset re-picked by the AI filter");
    assert_eq!(again.id, id);
    assert_eq!(again.retry_count, 2);
    assert_eq!(again.claimed_from.as_deref(), Some("failed"));
}

#[sqlx::test]
async fn ai_video_failure_is_repicked_by_the_same_stage(pool: PgPool) {
    seed_library(&pool, "lib").await;
    let id = seed_asset(&pool, "lib", "clip.mp4", AssetKind::Video).await;
    sqlx::query("UPDATE asset SET status = 'proxied' WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .expect("advance");
    sqlx::query(
        "INSERT INTO video_scene (asset_id, start_ts, end_ts, rep_frame_path, close_reason)
         VALUES ($1, 0, 10, 'video_scenes/lib/1/0.000_10.000.jpg', 'forced')",
    )
    .bind(id)
    .execute(&pool)
    .await
    .expect("seed scene");

    let stage = AiVideoStage::new(None, AnalysisMode::Light, false, false, Box::new(MockAnalyzer));
    let filter = stage.claim_filter();
    let claimed = asset::claim(&pool, "ai-video-host-1", &filter, 300)
        .await
        .expect("claim")
        .expect("eligible");
    asset::mark_failed(&pool, id, claimed.retry_count, "rep frame unreadable", false)
        .await
        .expect("mark failed");
    assert_eq!(asset_status(&pool, id).await, "failed");

    let again = asset::claim(&pool, "ai-video-host-2", &filter, 300)
        .await
        .expect("claim")
        .expect("failed video re-picked by the AI filter");
    assert_eq!(again.id, id);
    assert_eq!(again.retry_count, 2);
}

#[sqlx::test]
async fn repeated_failures_poison_after_cap(pool: PgPool) {
    seed_library(&pool, "lib").await;
    let id = seed_asset(&pool, "lib", "corrupt.jpg", AssetKind::Image).await;

    for attempt in 1..=6 {
        let claimed = asset::claim(&pool, "worker", &image_filter(), 300)
            .await
            .expect("claim")
            .unwrap_or_else(|| panic!("attempt {attempt} should find the asset"));
        assert_eq!(claimed.retry_count, attempt);
        let status = asset::mark_failed(&pool, id, claimed.retry_count, "decode error", false)
            .await
            .expect("mark failed");
        if attempt <= 5 {
            assert_eq!(status, AssetStatus::Failed);
        } else {
            assert_eq!(status, AssetStatus::Poisoned);
        }
    }

    assert_eq!(asset_status(&pool, id).await, "poisoned");
    let error: Option<String> = sqlx::query_scalar("SELECT error_message FROM asset WHERE id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await
        .expect("error message");
    let error = error.expect("populated");
    assert!(error.contains("decode error"));
    assert!(error.contains("retry limit exceeded"));

    // Poisoned is terminal: no claim and no reclaim touches it.
    assert!(asset::claim(&pool, "worker", &image_filter(), 300)
        .await
        .expect("claim")
        .is_none());
    asset::reclaim_expired(&pool, None).await.expect("sweep");
    assert_eq!(asset_status(&pool, id).await, "poisoned");

    // Only the operator path brings it back.
    let reset = asset::retry_poisoned(&pool, None).await.expect("retry poisoned");
    assert_eq!(reset, 1);
    assert_eq!(asset_status(&pool, id).await, "pending");
}

#[sqlx::test]
async fn claim_respects_effective_target_model(pool: PgPool) {
    let tuned: i64 = sqlx::query_scalar(
        "INSERT INTO ai_model (name, version) VALUES ('tuned', '1') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .expect("model");
    let stock: i64 = sqlx::query_scalar(
        "INSERT INTO ai_model (name, version) VALUES ('stock', '1') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .expect("model");

    seed_library(&pool, "override-lib").await;
    sqlx::query("UPDATE library SET target_model_id = $1 WHERE slug = 'override-lib'")
        .bind(tuned)
        .execute(&pool)
        .await
        .expect("set target");
    seed_library(&pool, "default-lib").await;

    let a = seed_asset(&pool, "override-lib", "a.jpg", AssetKind::Image).await;
    let b = seed_asset(&pool, "default-lib", "b.jpg", AssetKind::Image).await;
    sqlx::query("UPDATE asset SET status = 'proxied'")
        .execute(&pool)
        .await
        .expect("advance");

    let filter_for = |model: i64| ClaimFilter {
        worker_model_id: Some(model),
        system_default_model_id: Some(stock),
        ..ClaimFilter::new(AssetKind::Image, &[AssetStatus::Proxied])
    };

    // The stock worker must not steal the override library's asset.
    let claimed = asset::claim(&pool, "ai-stock", &filter_for(stock), 300)
        .await
        .expect("claim")
        .expect("default-lib asset eligible");
    assert_eq!(claimed.id, b);
    assert!(asset::claim(&pool, "ai-stock", &filter_for(stock), 300)
        .await
        .expect("claim")
        .is_none());

    let claimed = asset::claim(&pool, "ai-tuned", &filter_for(tuned), 300)
        .await
        .expect("claim")
        .expect("override-lib asset eligible");
    assert_eq!(claimed.id, a);
}

#[sqlx::test]
async fn release_claim_returns_the_retry(pool: PgPool) {
    seed_library(&pool, "lib").await;
    let id = seed_asset(&pool, "lib", "x.jpg", AssetKind::Image).await;
    let claimed = asset::claim(&pool, "worker", &image_filter(), 300)
        .await
        .expect("claim")
        .expect("eligible");
    assert_eq!(claimed.retry_count, 1);

    asset::release_claim(&pool, id).await.expect("release");
    let (status, retry): (String, i32) =
        sqlx::query_as("SELECT status, retry_count FROM asset WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .expect("row");
    assert_eq!(status, "pending");
    assert_eq!(retry, 0);
}

#[sqlx::test]
async fn soft_deleted_library_assets_are_invisible_to_claims(pool: PgPool) {
    seed_library(&pool, "lib").await;
    seed_asset(&pool, "lib", "x.jpg", AssetKind::Image).await;
    sqlx::query("UPDATE library SET deleted_at = NOW() WHERE slug = 'lib'")
        .execute(&pool)
        .await
        .expect("trash library");
    assert!(asset::claim(&pool, "worker", &image_filter(), 300)
        .await
        .expect("claim")
        .is_none());
}
