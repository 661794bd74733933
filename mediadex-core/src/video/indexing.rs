//! The resumable scene-indexing checkpoint. Drives the decode pipe through
//! the segmenter and persists every scene close in its own transaction, so a
//! crash at any point resumes from max(end_ts) with at most two seconds of
//! replay.

use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{MediadexError, Result};
use crate::repository::scene as scene_repo;
use crate::repository::scene::{NewActiveState, NewScene};
use crate::storage::StorageLayout;
use crate::video::highres;
use crate::video::pipe::FrameStream;
use crate::video::segment::{ResumeSeed, SceneEvent, SceneSegmenter};

/// Input-seek overlap tolerating seek imprecision on resume.
pub const RESUME_OVERLAP_SEC: f64 = 2.0;

const JPEG_QUALITY: u8 = 85;

pub struct IndexRequest<'a> {
    pub pool: &'a PgPool,
    pub layout: &'a StorageLayout,
    pub asset_id: i64,
    pub library_slug: &'a str,
    /// The stream the 1 fps pass decodes (the ephemeral 720p transcode).
    pub decode_path: &'a Path,
    /// Original file for targeted high-res re-extraction of rep frames;
    /// None falls back to the 480px decode frame.
    pub highres_source: Option<&'a Path>,
    pub lease_ttl_secs: i64,
    pub shutdown: &'a CancellationToken,
}

struct PassOutcome {
    scenes: u64,
    frames: u64,
    repro: String,
    stderr_tail: String,
}

fn encode_jpeg(frame: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode(frame, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| MediadexError::Internal(format!("jpeg encode failed: {e}")))?;
    Ok(out)
}

fn seed_to_state(seed: ResumeSeed) -> NewActiveState {
    NewActiveState {
        anchor_phash: seed.anchor_phash,
        scene_start_ts: seed.scene_start_ts,
        best_pts: seed.best_pts,
        best_sharpness: seed.best_sharpness,
    }
}

async fn persist_event(
    req: &IndexRequest<'_>,
    width: u32,
    height: u32,
    event: SceneEvent,
) -> Result<u64> {
    let next_state = event.next_state.map(seed_to_state);
    let Some(scene) = event.scene else {
        // Scene close with nothing persistable: still checkpoint the state.
        match &next_state {
            Some(state) => scene_repo::upsert_active_state(req.pool, req.asset_id, state).await?,
            None => scene_repo::delete_active_state(req.pool, req.asset_id).await?,
        }
        return Ok(0);
    };

    let rel = StorageLayout::scene_frame_rel(
        req.library_slug,
        req.asset_id,
        scene.start_ts,
        scene.end_ts,
    );
    let abs = req.layout.resolve(&rel);
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let jpeg = match req.highres_source {
        Some(source) => match highres::extract_frame(source, scene.best_pts).await? {
            Some(bytes) => bytes,
            None => encode_jpeg(&scene.best_frame, width, height)?,
        },
        None => encode_jpeg(&scene.best_frame, width, height)?,
    };
    tokio::fs::write(&abs, jpeg).await?;

    let row = NewScene {
        start_ts: scene.start_ts,
        end_ts: scene.end_ts,
        rep_frame_path: rel,
        sharpness: scene.sharpness,
        close_reason: scene.reason,
        description: None,
        metadata: None,
    };
    // Scene insert, active-state checkpoint and lease renewal commit
    // together; the resume point is never ahead of or behind the scenes.
    scene_repo::save_scene_close(
        req.pool,
        req.asset_id,
        &row,
        next_state.as_ref(),
        req.lease_ttl_secs,
    )
    .await?;
    info!(
        asset_id = req.asset_id,
        start_ts = scene.start_ts,
        end_ts = scene.end_ts,
        reason = %scene.reason,
        "scene closed"
    );
    Ok(1)
}

async fn run_pass(req: &IndexRequest<'_>, hwaccel: bool) -> Result<PassOutcome> {
    let max_end = scene_repo::max_end_ts(req.pool, req.asset_id).await?;
    let active = scene_repo::active_state(req.pool, req.asset_id).await?;
    let seek = max_end.map(|m| (m - RESUME_OVERLAP_SEC).max(0.0));

    let mut stream = FrameStream::open(req.decode_path, seek, hwaccel).await?;
    let (width, height) = (stream.width(), stream.height());
    let mut segmenter = match (&active, max_end) {
        (Some(state), _) => SceneSegmenter::resume(
            width,
            height,
            &state.anchor_phash,
            state.scene_start_ts,
            max_end,
        )?,
        (None, Some(m)) => {
            // The previous run ended cleanly; nothing to re-prime, just skip
            // the replayed overlap.
            let mut seg = SceneSegmenter::new(width, height);
            seg.set_discard_until(m);
            seg
        }
        (None, None) => SceneSegmenter::new(width, height),
    };

    let mut scenes = 0u64;
    loop {
        if req.shutdown.is_cancelled() {
            return Err(MediadexError::Cancelled(
                "scene indexing interrupted by shutdown".into(),
            ));
        }
        match stream.next_frame().await? {
            Some(frame) => {
                if let Some(event) = segmenter.push(&frame.bytes, frame.pts) {
                    scenes += persist_event(req, width, height, event).await?;
                }
            }
            None => {
                if let Some(event) = segmenter.finish(stream.duration()) {
                    scenes += persist_event(req, width, height, event).await?;
                }
                break;
            }
        }
    }
    Ok(PassOutcome {
        scenes,
        frames: stream.frames_read(),
        repro: stream.repro(),
        stderr_tail: stream.stderr_tail(),
    })
}

/// Segment one video, resuming from whatever is already persisted. Tries
/// hardware-assisted decode first and falls back to software when that
/// produces nothing or fails retryably. Returns the number of scenes saved
/// this run.
pub async fn index_scenes(req: &IndexRequest<'_>) -> Result<u64> {
    let had_scenes = scene_repo::max_end_ts(req.pool, req.asset_id)
        .await?
        .is_some();

    match run_pass(req, true).await {
        Ok(pass) if pass.frames > 0 || had_scenes => Ok(pass.scenes),
        Ok(pass) => {
            warn!(
                asset_id = req.asset_id,
                "hardware decode produced no frames; retrying with software decode"
            );
            let second = run_pass(req, false).await?;
            if second.frames == 0 {
                return Err(MediadexError::Poison(format!(
                    "no frames produced by decoder; video may be unsupported or corrupt\n\
                     Repro (hwaccel=auto): {}\nffmpeg stderr tail (hwaccel=auto):\n{}\n\
                     Repro (software): {}\nffmpeg stderr tail (software):\n{}",
                    pass.repro, pass.stderr_tail, second.repro, second.stderr_tail
                )));
            }
            Ok(second.scenes)
        }
        Err(e) if e.is_retryable() => {
            warn!(
                asset_id = req.asset_id,
                "decode with hwaccel failed ({e}); retrying with software decode"
            );
            let second = run_pass(req, false).await?;
            Ok(second.scenes)
        }
        Err(e) => Err(e),
    }
}
