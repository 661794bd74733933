//! Filesystem-to-database reconciliation. Claims a library whose scan was
//! requested, walks its root and upserts every recognized media file. The
//! upsert's dirty detection decides whether an asset re-enters the queue.

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{MediadexError, Result};
use crate::exts;
use crate::model::ScanStatus;
use crate::repository::{asset as asset_repo, library as library_repo};
use crate::worker::{WorkerContext, WorkerStage};

/// Heartbeat stats cadence, in files.
const STATS_INTERVAL: u64 = 1_000;
/// Cancellation poll cadence, in directory entries.
const STOP_CHECK_INTERVAL: u64 = 100;
/// mtimes are rounded so a float identical to the stored one never reads as
/// dirty after a DB round-trip.
const MTIME_DECIMALS: i32 = 3;

pub struct ScannerStage {
    library: Option<String>,
}

impl ScannerStage {
    pub fn new(library: Option<String>) -> Self {
        Self { library }
    }
}

fn round_mtime(mtime: f64) -> f64 {
    let factor = 10f64.powi(MTIME_DECIMALS);
    (mtime * factor).round() / factor
}

struct ScanOutcome {
    files: u64,
    directories: u64,
    interrupted: bool,
}

async fn walk_library(
    ctx: &WorkerContext,
    library_slug: &str,
    root: &Path,
) -> Result<ScanOutcome> {
    let mut files = 0u64;
    let mut directories = 0u64;
    let mut entries_since_check = 0u64;
    let mut interrupted = false;

    for entry in WalkDir::new(root).follow_links(false) {
        entries_since_check += 1;
        if entries_since_check >= STOP_CHECK_INTERVAL {
            entries_since_check = 0;
            if ctx.should_stop() {
                interrupted = true;
                break;
            }
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("scanner walk error under {}: {e}", root.display());
                continue;
            }
        };
        if entry.file_type().is_dir() {
            directories += 1;
            if ctx.should_stop() {
                interrupted = true;
                break;
            }
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(kind) = exts::kind_for_path(entry.path()) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("scanner stat error for {}: {e}", entry.path().display());
                continue;
            }
        };
        let rel_path = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| {
                MediadexError::Internal(format!(
                    "walked entry {} escapes root {}",
                    entry.path().display(),
                    root.display()
                ))
            })?
            .to_string_lossy()
            .replace('\\', "/");
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        asset_repo::upsert_from_scan(
            &ctx.pool,
            library_slug,
            &rel_path,
            kind,
            round_mtime(mtime),
            meta.len() as i64,
        )
        .await?;
        files += 1;

        if files % STATS_INTERVAL == 0 {
            ctx.stats.set(Some(json!({
                "files_processed": files,
                "directories_visited": directories,
                "library": library_slug,
            })));
            info!(library = library_slug, files, "scan progress");
        }
    }

    Ok(ScanOutcome {
        files,
        directories,
        interrupted,
    })
}

#[async_trait]
impl WorkerStage for ScannerStage {
    fn role(&self) -> &'static str {
        "scanner"
    }

    async fn process_one(&mut self, ctx: &WorkerContext) -> Result<bool> {
        let Some(library) =
            library_repo::claim_for_scan(&ctx.pool, self.library.as_deref()).await?
        else {
            return Ok(false);
        };

        let root = Path::new(&library.absolute_path);
        if !root.is_dir() {
            warn!(
                library = %library.slug,
                "library root {} missing; returning library to idle",
                root.display()
            );
            library_repo::set_scan_status(&ctx.pool, &library.slug, ScanStatus::Idle).await?;
            return Ok(true);
        }

        info!(library = %library.slug, root = %root.display(), "scan starting");
        let walked = walk_library(ctx, &library.slug, root).await;
        // The library goes back to idle on every exit path, interrupted or
        // failed scans included.
        library_repo::set_scan_status(&ctx.pool, &library.slug, ScanStatus::Idle).await?;
        let outcome = walked?;

        ctx.stats.set(Some(json!({
            "files_processed": outcome.files,
            "directories_visited": outcome.directories,
            "library": library.slug,
        })));
        if outcome.interrupted {
            info!(library = %library.slug, files = outcome.files, "scan interrupted");
            return Ok(false);
        }
        info!(
            library = %library.slug,
            files = outcome.files,
            directories = outcome.directories,
            "scan complete"
        );
        Ok(true)
    }
}
