//! Video proxy stage: one 720p transcode of the source into an ephemeral
//! file, then thumbnail, head clip and scene indexing all read that file.
//! The ephemeral transcode is deleted on every exit path.

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{MediadexError, Result};
use crate::model::{AssetKind, AssetStatus, ClaimedAsset};
use crate::repository::asset as asset_repo;
use crate::repository::asset::ClaimFilter;
use crate::repository::scene as scene_repo;
use crate::stage::repair_missing_derivatives;
use crate::storage::StorageLayout;
use crate::video::ffmpeg;
use crate::video::indexing::{index_scenes, IndexRequest};
use crate::video::segment;
use crate::worker::{WorkerContext, WorkerStage};

const HEAD_CLIP_SECONDS: f64 = 10.0;

pub struct VideoProxyStage {
    library: Option<String>,
    repair: bool,
    verbose: bool,
    processed: u64,
}

impl VideoProxyStage {
    pub fn new(library: Option<String>, repair: bool, verbose: bool) -> Self {
        Self {
            library,
            repair,
            verbose,
            processed: 0,
        }
    }

    fn set_stage(&self, ctx: &WorkerContext, asset: &ClaimedAsset, stage: &str) {
        ctx.stats.set(Some(json!({
            "current_asset_id": asset.id,
            "current_asset_rel_path": asset.rel_path,
            "current_stage": stage,
        })));
    }

    async fn run_pipeline(
        &self,
        ctx: &WorkerContext,
        layout: &StorageLayout,
        asset: &ClaimedAsset,
        source: &Path,
        temp: &Path,
    ) -> Result<()> {
        // Stale segmentations from a previous parameter generation are
        // dropped before re-segmenting. Null versions are legacy and stay.
        if let Some(stored) = asset.segmentation_version {
            if stored != segment::segmentation_version() {
                info!(
                    asset_id = asset.id,
                    stored,
                    current = segment::segmentation_version(),
                    "segmentation parameters changed; clearing old scenes"
                );
                scene_repo::clear_segmentation(&ctx.pool, asset.id).await?;
            }
        }

        self.set_stage(ctx, asset, "transcode");
        info!(asset_id = asset.id, source = %source.display(), "transcoding to 720p");
        let transcode = ffmpeg::transcode_720p(source, temp).await?;
        if !transcode.ok() {
            // A source that cannot be transcoded will not decode any better
            // on retry.
            return Err(MediadexError::Poison(
                transcode.describe_failure("720p transcode failed"),
            ));
        }

        if ctx.should_stop() {
            return Err(MediadexError::Cancelled("shutdown during proxy".into()));
        }

        self.set_stage(ctx, asset, "thumbnail");
        let thumb_path = layout.thumbnail_path(&asset.library_id, asset.id);
        if let Some(parent) = thumb_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let frame = ffmpeg::extract_frame_jpeg(temp, &thumb_path, 0.0).await?;
        if !frame.ok() {
            return Err(MediadexError::Transient(
                frame.describe_failure("thumbnail extraction failed"),
            ));
        }

        self.set_stage(ctx, asset, "head_clip");
        let clip_path = layout.head_clip_path(&asset.library_id, asset.id);
        if let Some(parent) = clip_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let clip = ffmpeg::copy_head_clip(temp, &clip_path, HEAD_CLIP_SECONDS).await?;
        if !clip.ok() {
            return Err(MediadexError::Transient(
                clip.describe_failure("head-clip stream copy failed"),
            ));
        }

        self.set_stage(ctx, asset, "scene_indexing");
        let request = IndexRequest {
            pool: &ctx.pool,
            layout,
            asset_id: asset.id,
            library_slug: &asset.library_id,
            decode_path: temp,
            highres_source: Some(source),
            lease_ttl_secs: ctx.lease_ttl_secs(),
            shutdown: &ctx.shutdown,
        };
        let scenes = index_scenes(&request).await?;
        info!(asset_id = asset.id, scenes, "scene indexing finished");

        asset_repo::set_video_preview_path(
            &ctx.pool,
            asset.id,
            &StorageLayout::head_clip_rel(&asset.library_id, asset.id),
        )
        .await?;
        asset_repo::set_segmentation_version(&ctx.pool, asset.id, segment::segmentation_version())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerStage for VideoProxyStage {
    fn role(&self) -> &'static str {
        "video-proxy"
    }

    async fn before_loop(&mut self, ctx: &WorkerContext) -> Result<()> {
        if self.repair {
            let layout = StorageLayout::new(&ctx.config.data_dir);
            repair_missing_derivatives(ctx, &layout, self.library.as_deref(), AssetKind::Video)
                .await?;
        }
        Ok(())
    }

    async fn process_one(&mut self, ctx: &WorkerContext) -> Result<bool> {
        let filter = ClaimFilter {
            library: self.library.clone(),
            ..ClaimFilter::new(
                AssetKind::Video,
                &[AssetStatus::Pending, AssetStatus::Failed],
            )
        };
        let Some(asset) =
            asset_repo::claim(&ctx.pool, &ctx.worker_id, &filter, ctx.lease_ttl_secs()).await?
        else {
            return Ok(false);
        };
        if ctx.should_stop() {
            asset_repo::release_claim(&ctx.pool, asset.id).await?;
            return Ok(false);
        }

        let layout = StorageLayout::new(&ctx.config.data_dir);
        let source = asset.source_path();
        let temp = layout.new_tmp_transcode(&asset.library_id);
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let outcome = self
            .run_pipeline(ctx, &layout, &asset, &source, &temp)
            .await;
        // Ephemeral transcode never survives the attempt.
        if let Err(e) = tokio::fs::remove_file(&temp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove temp transcode {}: {e}", temp.display());
            }
        }
        ctx.stats.set(None);

        match outcome {
            Ok(()) => {
                asset_repo::mark_succeeded(&ctx.pool, asset.id, AssetStatus::Proxied).await?;
                self.processed += 1;
                if self.verbose {
                    info!(
                        asset_id = asset.id,
                        rel_path = %asset.rel_path,
                        processed = self.processed,
                        "video proxied"
                    );
                }
                Ok(true)
            }
            Err(MediadexError::Cancelled(_)) => {
                // Shutdown mid-asset: the lease is released and the asset
                // returns to its pre-claim status; scenes already closed
                // stay and the next claim resumes from them.
                asset_repo::release_claim(&ctx.pool, asset.id).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(
                    asset_id = asset.id,
                    source = %source.display(),
                    "video proxy failed: {e}"
                );
                let permanent = matches!(e, MediadexError::Poison(_));
                asset_repo::mark_failed(&ctx.pool, asset.id, asset.retry_count, &e.to_string(), permanent)
                    .await?;
                Ok(true)
            }
        }
    }
}
