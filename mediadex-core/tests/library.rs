use sqlx::PgPool;

use mediadex_core::error::MediadexError;
use mediadex_core::repository::library;

#[sqlx::test]
async fn add_derives_slug_and_rejects_duplicates(pool: PgPool) {
    let slug = library::add(&pool, "Family Photos", "/srv/family")
        .await
        .expect("add");
    assert_eq!(slug, "family-photos");

    let err = library::add(&pool, "Family Photos", "/elsewhere")
        .await
        .expect_err("duplicate slug");
    assert!(matches!(err, MediadexError::Config(_)));
    assert!(err.to_string().contains("already exists"));
}

#[sqlx::test]
async fn slug_collision_applies_to_trashed_libraries(pool: PgPool) {
    library::add(&pool, "Archive", "/srv/archive").await.expect("add");
    library::soft_delete(&pool, "archive").await.expect("trash");

    // Invisible to normal queries...
    assert!(library::get(&pool, "archive", false)
        .await
        .expect("get")
        .is_none());
    assert!(library::get(&pool, "archive", true)
        .await
        .expect("get deleted")
        .is_some());

    // ...but the slug is still owned.
    let err = library::add(&pool, "Archive", "/srv/other")
        .await
        .expect_err("trashed slug still collides");
    assert!(err.to_string().contains("trash"));

    library::restore(&pool, "archive").await.expect("restore");
    assert!(library::get(&pool, "archive", false)
        .await
        .expect("get")
        .is_some());
}

#[sqlx::test]
async fn missing_library_error_suggests_listing(pool: PgPool) {
    let err = library::get_active_or_fail(&pool, "nope")
        .await
        .expect_err("missing library");
    assert!(matches!(err, MediadexError::NotFound(_)));
    assert!(err.to_string().contains("library list"));
}

#[sqlx::test]
async fn list_respects_include_deleted(pool: PgPool) {
    library::add(&pool, "Keep", "/srv/keep").await.expect("add");
    library::add(&pool, "Drop", "/srv/drop").await.expect("add");
    library::soft_delete(&pool, "drop").await.expect("trash");

    let visible = library::list(&pool, false).await.expect("list");
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].slug, "keep");

    let all = library::list(&pool, true).await.expect("list all");
    assert_eq!(all.len(), 2);

    let trashed = library::list_trashed(&pool).await.expect("trashed");
    assert_eq!(trashed.len(), 1);
    assert_eq!(trashed[0].slug, "drop");
}

#[sqlx::test]
async fn empty_trashed_requires_trash_and_cascades(pool: PgPool) {
    library::add(&pool, "Big", "/srv/big").await.expect("add");

    // Not trashed yet: refuse.
    let err = library::empty_trashed(&pool, "big")
        .await
        .expect_err("not in trash");
    assert!(err.to_string().contains("not in the trash"));

    // Seed assets and scene rows under it.
    for i in 0..20 {
        let asset_id: i64 = sqlx::query_scalar(
            "INSERT INTO asset (library_id, rel_path, kind, status)
             VALUES ('big', $1, 'video', 'proxied') RETURNING id",
        )
        .bind(format!("v{i}.mp4"))
        .fetch_one(&pool)
        .await
        .expect("asset");
        sqlx::query(
            "INSERT INTO video_scene (asset_id, start_ts, end_ts, rep_frame_path, close_reason)
             VALUES ($1, 0, 10, 'x.jpg', 'forced')",
        )
        .bind(asset_id)
        .execute(&pool)
        .await
        .expect("scene");
    }

    library::soft_delete(&pool, "big").await.expect("trash");
    let deleted = library::empty_trashed(&pool, "big").await.expect("empty");
    assert_eq!(deleted, 20);

    let assets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM asset WHERE library_id = 'big'")
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(assets, 0);
    let scenes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM video_scene")
        .fetch_one(&pool)
        .await
        .expect("count scenes");
    assert_eq!(scenes, 0);
    assert!(library::get(&pool, "big", true).await.expect("get").is_none());

    // The slug is free again.
    library::add(&pool, "Big", "/srv/big2").await.expect("re-add");
}

#[sqlx::test]
async fn scan_request_and_claim_round_trip(pool: PgPool) {
    library::add(&pool, "Cam Footage", "/srv/cam").await.expect("add");
    assert!(library::claim_for_scan(&pool, None)
        .await
        .expect("claim")
        .is_none());

    library::request_scan(&pool, "cam-footage").await.expect("request");
    let claimed = library::claim_for_scan(&pool, Some("cam-footage"))
        .await
        .expect("claim")
        .expect("requested library claimable");
    assert_eq!(claimed.slug, "cam-footage");
    assert_eq!(
        claimed.scan_status,
        mediadex_core::model::ScanStatus::Scanning
    );
}
