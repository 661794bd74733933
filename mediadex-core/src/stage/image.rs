//! Image proxy stage: one decode of the source, then a derivative cascade.
//! The WebP proxy comes from the decode and the JPEG thumbnail from the
//! proxy; nothing is ever upscaled.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{MediadexError, Result};
use crate::model::{AssetKind, AssetStatus};
use crate::repository::asset as asset_repo;
use crate::repository::asset::ClaimFilter;
use crate::stage::repair_missing_derivatives;
use crate::storage::StorageLayout;
use crate::worker::{WorkerContext, WorkerStage};

/// Long-edge bounds of the derivative cascade.
pub const PROXY_LONG_EDGE: u32 = 768;
pub const THUMBNAIL_LONG_EDGE: u32 = 320;

const JPEG_QUALITY: u8 = 85;

pub struct ImageProxyStage {
    library: Option<String>,
    repair: bool,
    verbose: bool,
    processed: u64,
    initial_pending: Option<i64>,
}

impl ImageProxyStage {
    pub fn new(library: Option<String>, repair: bool, verbose: bool) -> Self {
        Self {
            library,
            repair,
            verbose,
            processed: 0,
            initial_pending: None,
        }
    }
}

/// Downscale preserving aspect ratio; an image already inside the bound is
/// returned untouched.
fn bounded(image: &DynamicImage, long_edge: u32) -> DynamicImage {
    let (w, h) = image.dimensions();
    if w.max(h) <= long_edge {
        return image.clone();
    }
    let (tw, th) = if w >= h {
        (long_edge, (h as u64 * long_edge as u64 / w as u64).max(1) as u32)
    } else {
        ((w as u64 * long_edge as u64 / h as u64).max(1) as u32, long_edge)
    };
    image.resize_exact(tw, th, FilterType::Lanczos3)
}

fn write_derivatives(source: &Path, proxy_path: &Path, thumb_path: &Path) -> Result<()> {
    let decoded = image::open(source)
        .map_err(|e| MediadexError::Transient(format!("decode failed for {}: {e}", source.display())))?;

    let proxy = bounded(&decoded, PROXY_LONG_EDGE);
    if let Some(parent) = proxy_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rgb = proxy.to_rgb8();
    let mut webp = Vec::new();
    WebPEncoder::new_lossless(&mut webp)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(|e| MediadexError::Internal(format!("webp encode failed: {e}")))?;
    std::fs::write(proxy_path, webp)?;

    // Thumbnail comes from the proxy, not the source: the cascade reads the
    // original exactly once.
    let thumb = bounded(&proxy, THUMBNAIL_LONG_EDGE).to_rgb8();
    if let Some(parent) = thumb_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode(
            thumb.as_raw(),
            thumb.width(),
            thumb.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| MediadexError::Internal(format!("jpeg encode failed: {e}")))?;
    std::fs::write(thumb_path, jpeg)?;
    Ok(())
}

#[async_trait]
impl WorkerStage for ImageProxyStage {
    fn role(&self) -> &'static str {
        "image-proxy"
    }

    async fn before_loop(&mut self, ctx: &WorkerContext) -> Result<()> {
        if self.repair {
            let layout = StorageLayout::new(&ctx.config.data_dir);
            repair_missing_derivatives(ctx, &layout, self.library.as_deref(), AssetKind::Image)
                .await?;
        }
        if self.verbose {
            self.initial_pending = Some(
                asset_repo::count_claimable(&ctx.pool, AssetKind::Image, self.library.as_deref())
                    .await?,
            );
        }
        Ok(())
    }

    async fn process_one(&mut self, ctx: &WorkerContext) -> Result<bool> {
        let filter = ClaimFilter {
            library: self.library.clone(),
            ..ClaimFilter::new(
                AssetKind::Image,
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
        ctx.stats.set(Some(json!({
            "current_asset_id": asset.id,
            "current_asset_rel_path": asset.rel_path,
            "current_stage": "proxy",
        })));

        let layout = StorageLayout::new(&ctx.config.data_dir);
        let source = asset.source_path();
        let is_raw = source
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(crate::exts::is_raw_extension);
        if is_raw && !ctx.config.use_raw_previews {
            asset_repo::mark_failed(
                &ctx.pool,
                asset.id,
                asset.retry_count,
                "RAW preview generation is disabled (MEDIA_SEARCH_USE_RAW_PREVIEWS=false)",
                true,
            )
            .await?;
            return Ok(true);
        }
        let proxy_path: PathBuf = layout.proxy_path(&asset.library_id, asset.id);
        let thumb_path: PathBuf = layout.thumbnail_path(&asset.library_id, asset.id);

        let worked = {
            let source = source.clone();
            tokio::task::spawn_blocking(move || {
                write_derivatives(&source, &proxy_path, &thumb_path)
            })
            .await
            .map_err(|e| MediadexError::Internal(format!("derivative task panicked: {e}")))?
        };

        match worked {
            Ok(()) => {
                asset_repo::mark_succeeded(&ctx.pool, asset.id, AssetStatus::Proxied).await?;
                self.processed += 1;
                if self.verbose {
                    info!(
                        asset_id = asset.id,
                        rel_path = %asset.rel_path,
                        processed = self.processed,
                        pending = self.initial_pending.unwrap_or(-1),
                        "image proxied"
                    );
                }
            }
            Err(e) => {
                warn!(
                    asset_id = asset.id,
                    source = %source.display(),
                    "image proxy failed: {e}"
                );
                asset_repo::mark_failed(
                    &ctx.pool,
                    asset.id,
                    asset.retry_count,
                    &e.to_string(),
                    matches!(e, MediadexError::Poison(_)),
                )
                .await?;
            }
        }
        ctx.stats.set(None);
        Ok(true)
    }
}
