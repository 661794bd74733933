//! Janitor tasks: prune stale worker rows, reclaim expired leases, collect
//! aged temp transcodes. Safe to run from any host at any time; every task
//! is also run opportunistically by the `maintenance run` command.

use std::path::Path;
use std::time::{Duration, SystemTime};

use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::Result;
use crate::repository::{asset as asset_repo, worker as worker_repo};

/// Heartbeats older than this get the worker row pruned.
pub const STALE_WORKER_HOURS: i64 = 24;
/// Temp transcodes older than this are garbage.
pub const TEMP_MAX_AGE: Duration = Duration::from_secs(4 * 3600);

#[derive(Clone, Debug, Default)]
pub struct MaintenanceReport {
    pub workers_pruned: u64,
    pub leases_reclaimed: u64,
    pub temp_files_deleted: u64,
    pub temp_bytes_deleted: u64,
}

pub struct Maintenance<'a> {
    pool: &'a PgPool,
    data_dir: &'a Path,
    hostname: String,
}

impl<'a> Maintenance<'a> {
    pub fn new(pool: &'a PgPool, data_dir: &'a Path, hostname: String) -> Self {
        Self {
            pool,
            data_dir,
            hostname,
        }
    }

    pub async fn run_all(
        &self,
        library: Option<&str>,
        dry_run: bool,
    ) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        if dry_run {
            report.workers_pruned =
                worker_repo::count_stale(self.pool, STALE_WORKER_HOURS).await? as u64;
            report.leases_reclaimed =
                asset_repo::count_expired_leases(self.pool, library).await? as u64;
            let (files, bytes) = self.scan_temp(library, false).await?;
            report.temp_files_deleted = files;
            report.temp_bytes_deleted = bytes;
            return Ok(report);
        }
        report.workers_pruned = worker_repo::prune_stale(self.pool, STALE_WORKER_HOURS).await?;
        report.leases_reclaimed = asset_repo::reclaim_expired(self.pool, library).await?;
        let (files, bytes) = self.cleanup_temp(library).await?;
        report.temp_files_deleted = files;
        report.temp_bytes_deleted = bytes;
        Ok(report)
    }

    /// Delete aged files under `<data_dir>/tmp[/<library>]`. Skipped
    /// entirely while a worker on this host reports an active transcode;
    /// other hosts' tmp trees are never this host's to clean.
    pub async fn cleanup_temp(&self, library: Option<&str>) -> Result<(u64, u64)> {
        if worker_repo::has_active_local_transcode(self.pool, &self.hostname).await? {
            info!("active transcode on this host; skipping temp cleanup");
            return Ok((0, 0));
        }
        self.scan_temp(library, true).await
    }

    async fn scan_temp(&self, library: Option<&str>, delete: bool) -> Result<(u64, u64)> {
        let mut tmp_dir = self.data_dir.join("tmp");
        if let Some(slug) = library {
            tmp_dir = tmp_dir.join(slug);
        }
        if !tmp_dir.is_dir() {
            return Ok((0, 0));
        }
        let cutoff = SystemTime::now() - TEMP_MAX_AGE;
        let mut files = 0u64;
        let mut bytes = 0u64;
        let mut empty_dirs = Vec::new();
        for entry in walkdir::WalkDir::new(&tmp_dir)
            .follow_links(false)
            .contents_first(true)
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("temp walk error: {e}");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                if entry.path() != tmp_dir {
                    empty_dirs.push(entry.path().to_path_buf());
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let old = meta.modified().map(|m| m < cutoff).unwrap_or(false);
            if !old {
                continue;
            }
            if delete {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("could not delete {}: {e}", entry.path().display());
                    continue;
                }
            }
            files += 1;
            bytes += meta.len();
        }
        if delete {
            for dir in empty_dirs {
                // Only empty directories go; read_dir-based check via rmdir.
                let _ = std::fs::remove_dir(&dir);
            }
        }
        Ok((files, bytes))
    }
}
