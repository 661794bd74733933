//! Composite cut detection: perceptual-hash drift against the scene anchor,
//! a temporal ceiling, and a debounce window, with best-frame selection by
//! Laplacian sharpness. Push-based and free of IO, so the same inputs and
//! parameters always produce the same scene sequence.

use image::RgbImage;
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};

use crate::error::{MediadexError, Result};
use crate::model::SceneCloseReason;

/// Hamming-distance cutoff out of 256 bits.
pub const PHASH_THRESHOLD: u32 = 51;
/// Hash grid; 16x16 = 256 bits.
pub const PHASH_SIZE: u32 = 16;
/// A scene is force-closed after this long regardless of drift.
pub const TEMPORAL_CEILING_SEC: f64 = 30.0;
/// Minimum scene age before a pHash-triggered cut is honored.
pub const DEBOUNCE_SEC: f64 = 3.0;
/// Frames skipped at each scene open before best-frame tracking starts, so
/// transition blur and fade-ins are never chosen as representative.
pub const BEST_FRAME_WARMUP: u32 = 2;

/// Encodes the cut parameters; persisted per asset so a parameter change
/// invalidates old segmentations.
pub fn segmentation_version() -> i64 {
    PHASH_THRESHOLD as i64 * 10_000 + (DEBOUNCE_SEC * 1_000.0) as i64
}

/// One closed scene with its representative frame still in memory.
#[derive(Clone, Debug)]
pub struct ClosedScene {
    pub start_ts: f64,
    pub end_ts: f64,
    pub best_frame: Vec<u8>,
    pub best_pts: f64,
    pub sharpness: f64,
    pub reason: SceneCloseReason,
}

/// Resume state for the scene that opens at a cut. Persisted with the close
/// so a crash can re-prime the segmenter.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumeSeed {
    pub anchor_phash: String,
    pub scene_start_ts: f64,
    pub best_pts: f64,
    pub best_sharpness: f64,
}

/// Emitted whenever a scene closes. `scene` is None when the closing scene
/// had no eligible best frame (shorter than the warmup); `next_state` is
/// None at end of stream.
#[derive(Debug)]
pub struct SceneEvent {
    pub scene: Option<ClosedScene>,
    pub next_state: Option<ResumeSeed>,
}

struct BestFrame {
    bytes: Vec<u8>,
    pts: f64,
    sharpness: f64,
}

struct LastFrame {
    bytes: Vec<u8>,
    pts: f64,
    sharpness: f64,
}

pub struct SceneSegmenter {
    width: u32,
    height: u32,
    hasher: Hasher,
    anchor: Option<ImageHash>,
    scene_start: f64,
    warmup: u32,
    best: Option<BestFrame>,
    last: Option<LastFrame>,
    discard_until: Option<f64>,
}

impl SceneSegmenter {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            hasher: HasherConfig::new()
                .hash_alg(HashAlg::Gradient)
                .hash_size(PHASH_SIZE, PHASH_SIZE)
                .to_hasher(),
            anchor: None,
            scene_start: 0.0,
            warmup: BEST_FRAME_WARMUP,
            best: None,
            last: None,
            discard_until: None,
        }
    }

    /// Re-prime from persisted active state: the anchor and start of the
    /// scene that was open when the previous run stopped, plus the resume
    /// point below which replayed frames are discarded.
    pub fn resume(
        width: u32,
        height: u32,
        anchor_phash: &str,
        scene_start_ts: f64,
        discard_until: Option<f64>,
    ) -> Result<Self> {
        let anchor = ImageHash::from_base64(anchor_phash).map_err(|e| {
            MediadexError::Internal(format!("stored anchor pHash does not parse: {e:?}"))
        })?;
        let mut seg = Self::new(width, height);
        seg.anchor = Some(anchor);
        seg.scene_start = scene_start_ts;
        seg.discard_until = discard_until;
        Ok(seg)
    }

    /// Discard replayed frames below this PTS without opening a scene
    /// (resume after a clean stop, where no active state exists).
    pub fn set_discard_until(&mut self, pts: f64) {
        self.discard_until = Some(pts);
    }

    fn phash(&self, frame: &[u8]) -> ImageHash {
        let img = RgbImage::from_raw(self.width, self.height, frame.to_vec())
            .expect("frame length matches dimensions");
        self.hasher.hash_image(&img)
    }

    fn cut_reason(&self, hash: &ImageHash, pts: f64) -> Option<SceneCloseReason> {
        let anchor = self.anchor.as_ref()?;
        let elapsed = pts - self.scene_start;
        if elapsed >= TEMPORAL_CEILING_SEC {
            return Some(SceneCloseReason::Temporal);
        }
        if anchor.dist(hash) <= PHASH_THRESHOLD {
            return None;
        }
        if elapsed < DEBOUNCE_SEC {
            return None;
        }
        Some(SceneCloseReason::Phash)
    }

    fn close_scene(
        &mut self,
        end_pts: f64,
        reason: SceneCloseReason,
        next_anchor: Option<(&ImageHash, f64)>,
    ) -> SceneEvent {
        let next_state = next_anchor.map(|(hash, pts)| ResumeSeed {
            anchor_phash: hash.to_base64(),
            scene_start_ts: pts,
            best_pts: pts,
            best_sharpness: -1.0,
        });
        let scene = match self.best.take() {
            Some(best) => Some(ClosedScene {
                start_ts: self.scene_start,
                end_ts: end_pts,
                best_frame: best.bytes,
                best_pts: best.pts,
                sharpness: best.sharpness,
                reason,
            }),
            // A forced close of a scene too short for an eligible best still
            // persists, using the final frame: the tail of the video must
            // remain searchable.
            None if reason == SceneCloseReason::Forced => {
                self.last.as_ref().map(|last| ClosedScene {
                    start_ts: self.scene_start,
                    end_ts: end_pts,
                    best_frame: last.bytes.clone(),
                    best_pts: last.pts,
                    sharpness: last.sharpness,
                    reason,
                })
            }
            None => None,
        };
        self.scene_start = end_pts;
        self.anchor = None;
        self.warmup = BEST_FRAME_WARMUP;
        self.best = None;
        SceneEvent { scene, next_state }
    }

    /// Feed one `(frame, pts)` pair. Returns an event when this frame closed
    /// a scene.
    pub fn push(&mut self, frame: &[u8], pts: f64) -> Option<SceneEvent> {
        debug_assert_eq!(frame.len(), (self.width * self.height * 3) as usize);
        let sharp = sharpness(frame, self.width, self.height);
        self.last = Some(LastFrame {
            bytes: frame.to_vec(),
            pts,
            sharpness: sharp,
        });

        if let Some(limit) = self.discard_until {
            if pts < limit {
                return None;
            }
            self.discard_until = None;
        }

        let hash = self.phash(frame);
        if self.anchor.is_none() {
            self.anchor = Some(hash.clone());
            self.scene_start = pts;
            self.warmup = BEST_FRAME_WARMUP;
            self.best = None;
        }

        let event = self.cut_reason(&hash, pts).map(|reason| {
            let event = self.close_scene(pts, reason, Some((&hash, pts)));
            self.anchor = Some(hash.clone());
            self.scene_start = pts;
            event
        });

        if self.warmup > 0 {
            self.warmup -= 1;
        } else if self.best.as_ref().map_or(true, |b| sharp > b.sharpness) {
            self.best = Some(BestFrame {
                bytes: frame.to_vec(),
                pts,
                sharpness: sharp,
            });
        }
        event
    }

    /// End of stream: flush the open scene as `forced`, extending its end to
    /// the container duration when that is known and greater. Returns None
    /// when no scene is open (nothing decoded, or everything was discarded
    /// during resume catch-up with no primed state).
    pub fn finish(&mut self, duration: Option<f64>) -> Option<SceneEvent> {
        self.anchor.as_ref()?;
        let last_pts = self.last.as_ref().map_or(self.scene_start, |l| l.pts);
        // Never close behind the scene start, whatever the container claims.
        let end = duration
            .map_or(last_pts, |d| d.max(last_pts))
            .max(self.scene_start);
        let event = self.close_scene(end, SceneCloseReason::Forced, None);
        event.scene.is_some().then_some(event)
    }
}

/// Laplacian variance on the luma plane: the classic cheap focus measure.
/// Computed on the 480px decode so no full-resolution frame is ever held.
pub fn sharpness(frame: &[u8], width: u32, height: u32) -> f64 {
    let (w, h) = (width as usize, height as usize);
    debug_assert_eq!(frame.len(), w * h * 3);
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut luma = vec![0f64; w * h];
    for (i, px) in frame.chunks_exact(3).enumerate() {
        luma[i] = 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64;
    }
    let mut sum = 0f64;
    let mut sum_sq = 0f64;
    let n = ((w - 2) * (h - 2)) as f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = luma[y * w + x];
            let lap = luma[(y - 1) * w + x] + luma[(y + 1) * w + x] + luma[y * w + x - 1]
                + luma[y * w + x + 1]
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const W: u32 = 480;
    const H: u32 = 270;

    /// Horizontal luminance ramp; `reversed` flips its direction. Monotone
    /// ramps survive resizing, so their gradient hashes are maximally apart.
    fn ramp_frame(reversed: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity((W * H * 3) as usize);
        for _y in 0..H {
            for x in 0..W {
                let v = (x * 255 / (W - 1)) as u8;
                let v = if reversed { 255 - v } else { v };
                buf.extend_from_slice(&[v, v, v]);
            }
        }
        buf
    }

    /// A ramp with added per-pixel detail, so sharpness differs from the
    /// plain ramp while the hash stays in the same family.
    fn noisy_ramp_frame(seed: u32) -> Vec<u8> {
        let mut buf = ramp_frame(false);
        let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
        for chunk in buf.chunks_exact_mut(3) {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            let noise = (state >> 24) as i32 - 128;
            let v = (chunk[0] as i32 + noise / 4).clamp(0, 255) as u8;
            chunk[0] = v;
            chunk[1] = v;
            chunk[2] = v;
        }
        buf
    }

    fn reasons(scenes: &[ClosedScene]) -> Vec<SceneCloseReason> {
        scenes.iter().map(|s| s.reason).collect()
    }

    fn run_segmenter(
        seg: &mut SceneSegmenter,
        frames: impl IntoIterator<Item = (Vec<u8>, f64)>,
        duration: Option<f64>,
    ) -> (Vec<ClosedScene>, Vec<Option<ResumeSeed>>) {
        let mut scenes = Vec::new();
        let mut states = Vec::new();
        for (frame, pts) in frames {
            if let Some(event) = seg.push(&frame, pts) {
                states.push(event.next_state);
                if let Some(scene) = event.scene {
                    scenes.push(scene);
                }
            }
        }
        if let Some(event) = seg.finish(duration) {
            states.push(event.next_state);
            if let Some(scene) = event.scene {
                scenes.push(scene);
            }
        }
        (scenes, states)
    }

    #[test]
    fn identical_frames_cut_on_temporal_ceiling_only() {
        let mut seg = SceneSegmenter::new(W, H);
        let frames = (0..70).map(|t| (ramp_frame(false), t as f64));
        let (scenes, _) = run_segmenter(&mut seg, frames, Some(70.0));
        assert_eq!(
            reasons(&scenes),
            vec![
                SceneCloseReason::Temporal,
                SceneCloseReason::Temporal,
                SceneCloseReason::Forced
            ]
        );
        assert_eq!(scenes[0].start_ts, 0.0);
        assert_eq!(scenes[0].end_ts, 30.0);
        assert_eq!(scenes[1].end_ts, 60.0);
        // Forced tail extends to the container duration past the last frame.
        assert_eq!(scenes[2].end_ts, 70.0);
    }

    #[test]
    fn hard_cut_triggers_phash_reason() {
        // Hard cut at 10s, then drift-free content until the ceiling.
        let mut seg = SceneSegmenter::new(W, H);
        let frames = (0..70).map(|t| (ramp_frame(t >= 10), t as f64));
        let (scenes, _) = run_segmenter(&mut seg, frames, Some(70.0));
        assert_eq!(
            reasons(&scenes),
            vec![
                SceneCloseReason::Phash,
                SceneCloseReason::Temporal,
                SceneCloseReason::Forced
            ]
        );
        assert_eq!(scenes[0].end_ts, 10.0);
        assert_eq!(scenes[1].start_ts, 10.0);
        assert_eq!(scenes[1].end_ts, 40.0);
        assert_eq!(scenes[2].end_ts, 70.0);
    }

    #[test]
    fn debounce_suppresses_early_phash_cut() {
        // Flip content every second: far over threshold each frame, but the
        // debounce turns what would be per-frame cuts into >= 3s scenes.
        let mut seg = SceneSegmenter::new(W, H);
        let frames = (0..12).map(|t| (ramp_frame(t % 2 == 1), t as f64));
        let (scenes, _) = run_segmenter(&mut seg, frames, Some(12.0));
        for scene in &scenes[..scenes.len() - 1] {
            assert!(
                scene.end_ts - scene.start_ts >= DEBOUNCE_SEC,
                "scene [{}, {}) violates debounce",
                scene.start_ts,
                scene.end_ts
            );
        }
    }

    #[test]
    fn scenes_are_ordered_and_non_overlapping() {
        let mut seg = SceneSegmenter::new(W, H);
        let frames = (0..70).map(|t| (ramp_frame(t >= 10 && t < 40), t as f64));
        let (scenes, _) = run_segmenter(&mut seg, frames, Some(70.0));
        for pair in scenes.windows(2) {
            assert!(pair[0].end_ts <= pair[1].start_ts);
            assert!(pair[0].start_ts < pair[1].start_ts);
        }
    }

    #[test]
    fn best_frame_skips_warmup_and_prefers_sharpness() {
        // Frame 0 and 1 are in warmup; among the rest, the noisy frame at
        // t=5 is sharpest.
        let mut seg = SceneSegmenter::new(W, H);
        let mut frames: Vec<(Vec<u8>, f64)> =
            (0..10).map(|t| (ramp_frame(false), t as f64)).collect();
        frames[5].0 = noisy_ramp_frame(42);
        let (scenes, _) = run_segmenter(&mut seg, frames, Some(10.0));
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].best_pts, 5.0);
        assert!(scenes[0].sharpness > 0.0);
    }

    #[test]
    fn short_tail_scene_falls_back_to_last_frame() {
        // Two frames only: fewer than warmup, so no eligible best; the
        // forced close must still yield a scene from the last frame.
        let mut seg = SceneSegmenter::new(W, H);
        let frames = (0..2).map(|t| (ramp_frame(false), t as f64));
        let (scenes, states) = run_segmenter(&mut seg, frames, Some(2.0));
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].reason, SceneCloseReason::Forced);
        assert_eq!(scenes[0].best_pts, 1.0);
        // End of stream: no next state to persist.
        assert_eq!(states, vec![None]);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        let mut seg = SceneSegmenter::new(W, H);
        assert!(seg.finish(Some(10.0)).is_none());
    }

    #[test]
    fn resume_matches_crash_free_run() {
        let frames: Vec<(Vec<u8>, f64)> = (0..70)
            .map(|t| (ramp_frame(t >= 10), t as f64))
            .collect();

        // Crash-free reference.
        let mut seg = SceneSegmenter::new(W, H);
        let (reference, _) = run_segmenter(&mut seg, frames.clone(), Some(70.0));
        assert!(reference.len() >= 2);

        // Crash immediately after the first scene closes: the persisted
        // state is the first event's next_state, persisted scenes = [first].
        let mut seg = SceneSegmenter::new(W, H);
        let mut first_event = None;
        for (frame, pts) in &frames {
            if let Some(event) = seg.push(frame, *pts) {
                first_event = Some(event);
                break;
            }
        }
        let first_event = first_event.expect("a scene closes before EOF");
        let first_scene = first_event.scene.expect("first scene persists");
        let state = first_event.next_state.expect("mid-stream close has state");

        // Restart: seek overlap of 2s, discard until max(end_ts).
        let max_end = first_scene.end_ts;
        let resume_from = (max_end - 2.0).max(0.0);
        let mut seg = SceneSegmenter::resume(
            W,
            H,
            &state.anchor_phash,
            state.scene_start_ts,
            Some(max_end),
        )
        .unwrap();
        let replay = frames
            .iter()
            .filter(|(_, pts)| *pts >= resume_from)
            .cloned();
        let (resumed, _) = run_segmenter(&mut seg, replay, Some(70.0));

        let mut combined = vec![first_scene];
        combined.extend(resumed);
        let bounds = |scenes: &[ClosedScene]| -> Vec<(f64, f64, SceneCloseReason)> {
            scenes.iter().map(|s| (s.start_ts, s.end_ts, s.reason)).collect()
        };
        assert_eq!(bounds(&combined), bounds(&reference));
    }

    #[test]
    fn segmentation_version_encodes_parameters() {
        assert_eq!(segmentation_version(), 513_000);
    }

    #[test]
    fn sharpness_orders_flat_below_detailed() {
        let flat = vec![128u8; (W * H * 3) as usize];
        assert_eq!(sharpness(&flat, W, H), 0.0);
        let detailed = noisy_ramp_frame(7);
        assert!(sharpness(&detailed, W, H) > sharpness(&ramp_frame(false), W, H));
    }
}
