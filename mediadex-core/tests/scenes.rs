use sqlx::PgPool;

use mediadex_core::model::SceneCloseReason;
use mediadex_core::repository::scene::{self, NewActiveState, NewScene};

async fn seed_video_asset(pool: &PgPool) -> i64 {
    sqlx::query(
        "INSERT INTO library (slug, name, absolute_path, is_active, scan_status)
         VALUES ('lib', 'lib', '/srv/media', TRUE, 'idle')",
    )
    .execute(pool)
    .await
    .expect("seed library");
    sqlx::query_scalar(
        "INSERT INTO asset (library_id, rel_path, kind, status, worker_id, lease_expires_at)
         VALUES ('lib', 'clip.mp4', 'video', 'processing', 'video-proxy-h-1',
                 NOW() - INTERVAL '1 minute')
         RETURNING id",
    )
    .fetch_one(pool)
    .await
    .expect("seed asset")
}

fn scene(start: f64, end: f64, reason: SceneCloseReason) -> NewScene {
    NewScene {
        start_ts: start,
        end_ts: end,
        rep_frame_path: format!("video_scenes/lib/1/{start:.3}_{end:.3}.jpg"),
        sharpness: 12.5,
        close_reason: reason,
        description: None,
        metadata: None,
    }
}

fn state(anchor: &str, start: f64) -> NewActiveState {
    NewActiveState {
        anchor_phash: anchor.into(),
        scene_start_ts: start,
        best_pts: start,
        best_sharpness: -1.0,
    }
}

#[sqlx::test]
async fn scene_close_persists_scene_state_and_lease_together(pool: PgPool) {
    let asset_id = seed_video_asset(&pool).await;

    let scene_id = scene::save_scene_close(
        &pool,
        asset_id,
        &scene(0.0, 10.0, SceneCloseReason::Phash),
        Some(&state("aGFzaA==", 10.0)),
        300,
    )
    .await
    .expect("scene close");
    assert!(scene_id > 0);

    let saved = scene::list(&pool, asset_id).await.expect("list");
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].close_reason, SceneCloseReason::Phash);

    let active = scene::active_state(&pool, asset_id)
        .await
        .expect("active state")
        .expect("state row exists");
    assert_eq!(active.anchor_phash, "aGFzaA==");
    assert_eq!(active.scene_start_ts, 10.0);

    // The same transaction renewed the (previously expired) lease.
    let lease_ok: bool =
        sqlx::query_scalar("SELECT lease_expires_at > NOW() FROM asset WHERE id = $1")
            .bind(asset_id)
            .fetch_one(&pool)
            .await
            .expect("lease");
    assert!(lease_ok);

    assert_eq!(
        scene::max_end_ts(&pool, asset_id).await.expect("max end"),
        Some(10.0)
    );
}

#[sqlx::test]
async fn final_scene_close_deletes_active_state(pool: PgPool) {
    let asset_id = seed_video_asset(&pool).await;
    scene::save_scene_close(
        &pool,
        asset_id,
        &scene(0.0, 10.0, SceneCloseReason::Phash),
        Some(&state("YQ==", 10.0)),
        300,
    )
    .await
    .expect("first close");
    scene::save_scene_close(
        &pool,
        asset_id,
        &scene(10.0, 70.0, SceneCloseReason::Forced),
        None,
        300,
    )
    .await
    .expect("final close");

    assert!(scene::active_state(&pool, asset_id)
        .await
        .expect("read")
        .is_none());
    assert_eq!(
        scene::max_end_ts(&pool, asset_id).await.expect("max end"),
        Some(70.0)
    );
}

#[sqlx::test]
async fn persisted_scenes_stay_ordered_and_disjoint(pool: PgPool) {
    let asset_id = seed_video_asset(&pool).await;
    for (start, end) in [(0.0, 10.0), (10.0, 40.0), (40.0, 70.0)] {
        scene::save_scene_close(
            &pool,
            asset_id,
            &scene(start, end, SceneCloseReason::Temporal),
            Some(&state("YQ==", end)),
            300,
        )
        .await
        .expect("close");
    }
    let scenes = scene::list(&pool, asset_id).await.expect("list");
    assert_eq!(scenes.len(), 3);
    for pair in scenes.windows(2) {
        assert!(pair[0].start_ts < pair[1].start_ts);
        assert!(pair[0].end_ts <= pair[1].start_ts, "scenes never overlap");
    }

    // Ordering by end_ts is the same ordering.
    let by_end: Vec<i64> = sqlx::query_scalar(
        "SELECT id FROM video_scene WHERE asset_id = $1 ORDER BY end_ts",
    )
    .bind(asset_id)
    .fetch_all(&pool)
    .await
    .expect("order by end");
    let by_start: Vec<i64> = scenes.iter().map(|s| s.id).collect();
    assert_eq!(by_end, by_start);
}

#[sqlx::test]
async fn clear_segmentation_removes_everything(pool: PgPool) {
    let asset_id = seed_video_asset(&pool).await;
    sqlx::query(
        "UPDATE asset SET video_preview_path = 'video_clips/lib/1/head_clip.mp4',
                          segmentation_version = 513000 WHERE id = $1",
    )
    .bind(asset_id)
    .execute(&pool)
    .await
    .expect("set derivatives");
    scene::save_scene_close(
        &pool,
        asset_id,
        &scene(0.0, 10.0, SceneCloseReason::Phash),
        Some(&state("YQ==", 10.0)),
        300,
    )
    .await
    .expect("close");

    scene::clear_segmentation(&pool, asset_id).await.expect("clear");

    assert!(scene::list(&pool, asset_id).await.expect("list").is_empty());
    assert!(scene::active_state(&pool, asset_id)
        .await
        .expect("state")
        .is_none());
    let (preview, version): (Option<String>, Option<i64>) = sqlx::query_as(
        "SELECT video_preview_path, segmentation_version FROM asset WHERE id = $1",
    )
    .bind(asset_id)
    .fetch_one(&pool)
    .await
    .expect("asset row");
    assert!(preview.is_none());
    assert!(version.is_none());
}

#[sqlx::test]
async fn vision_backfill_updates_and_completeness_queries(pool: PgPool) {
    let asset_id = seed_video_asset(&pool).await;
    for (start, end) in [(0.0, 10.0), (10.0, 30.0)] {
        scene::save_scene_close(
            &pool,
            asset_id,
            &scene(start, end, SceneCloseReason::Phash),
            Some(&state("YQ==", end)),
            300,
        )
        .await
        .expect("close");
    }
    let scenes = scene::list(&pool, asset_id).await.expect("list");
    assert_eq!(
        scene::scenes_missing_description(&pool, asset_id)
            .await
            .expect("missing")
            .len(),
        2
    );

    let metadata = serde_json::json!({
        "vision": {"description": "a harbor at dusk", "tags": ["harbor"], "ocr_text": ""}
    });
    scene::update_scene_vision(&pool, scenes[0].id, Some("a harbor at dusk"), &metadata)
        .await
        .expect("update");

    assert_eq!(
        scene::scenes_missing_description(&pool, asset_id)
            .await
            .expect("missing")
            .len(),
        1
    );
    let missing_ocr = scene::scenes_missing_ocr(&pool, asset_id)
        .await
        .expect("missing ocr");
    assert_eq!(missing_ocr, vec![scenes[1].id]);
    assert_eq!(
        scene::last_description(&pool, asset_id).await.expect("last"),
        None,
        "the latest scene by end_ts is still undescribed"
    );
}
