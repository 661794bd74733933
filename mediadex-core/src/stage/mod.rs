pub mod ai;
pub mod image;
pub mod video;

use tracing::info;

use crate::error::Result;
use crate::model::AssetKind;
use crate::repository::asset as asset_repo;
use crate::storage::StorageLayout;
use crate::worker::WorkerContext;

const REPAIR_PAGE: i64 = 500;

/// Reset assets whose derivatives went missing on disk back to `pending`.
/// Shared by both proxy stages' `--repair` mode; regeneration itself runs
/// through the normal claim path, so this only ever moves statuses backward.
pub async fn repair_missing_derivatives(
    ctx: &WorkerContext,
    layout: &StorageLayout,
    library: Option<&str>,
    kind: AssetKind,
) -> Result<u64> {
    let mut offset = 0i64;
    let mut reset = 0u64;
    let mut checked = 0u64;
    loop {
        let batch =
            asset_repo::derivative_expectations(&ctx.pool, kind, library, REPAIR_PAGE, offset)
                .await?;
        if batch.is_empty() {
            break;
        }
        let page_len = batch.len() as i64;
        for (asset_id, library_slug, preview_path) in batch {
            if ctx.should_stop() {
                return Ok(reset);
            }
            let missing = match kind {
                AssetKind::Image => {
                    !layout.proxy_path(&library_slug, asset_id).is_file()
                        || !layout.thumbnail_path(&library_slug, asset_id).is_file()
                }
                AssetKind::Video => {
                    let head_clip = match &preview_path {
                        Some(rel) => layout.resolve(rel),
                        None => layout.head_clip_path(&library_slug, asset_id),
                    };
                    !layout.thumbnail_path(&library_slug, asset_id).is_file()
                        || !head_clip.is_file()
                }
            };
            if missing {
                asset_repo::reset_to_pending(&ctx.pool, asset_id).await?;
                reset += 1;
            }
            checked += 1;
        }
        offset += page_len;
        if page_len < REPAIR_PAGE {
            break;
        }
    }
    if reset > 0 {
        info!(checked, reset, "repair pass reset assets with missing derivatives");
    }
    Ok(reset)
}
