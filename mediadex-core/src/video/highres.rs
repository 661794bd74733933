//! Targeted high-resolution re-extraction. After a scene closes, its chosen
//! PTS is decoded again from the original file at full resolution: a short
//! MJPEG window on stdout, showinfo PTS lines on stderr, paired by order.
//! This keeps full-res frames out of memory during the 1 fps pass.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::Result;
use crate::video::pipe::parse_pts_line;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

const WINDOW_START_OFFSET: f64 = 0.5;
const WINDOW_DURATION: f64 = 1.0;

/// Split an MJPEG byte stream into complete SOI..EOI frames. An incomplete
/// trailing frame is discarded.
pub fn split_mjpeg_frames(stream: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i + 4 <= stream.len() {
        let Some(start) = find(stream, i, &SOI) else {
            break;
        };
        let Some(end) = find(stream, start + 2, &EOI) else {
            break;
        };
        frames.push(&stream[start..end + 2]);
        i = end + 2;
    }
    frames
}

fn find(haystack: &[u8], from: usize, needle: &[u8; 2]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Decode a ~1 second window around `target_pts` and return the JPEG bytes
/// of the frame closest to it, or None when the window yields nothing.
pub async fn extract_frame(video: &Path, target_pts: f64) -> Result<Option<Vec<u8>>> {
    let start = (target_pts - WINDOW_START_OFFSET).max(0.0);
    let output = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "info",
            "-ss",
            &format!("{start}"),
            "-t",
            &format!("{WINDOW_DURATION}"),
            "-i",
        ])
        .arg(video)
        .args([
            "-vf",
            "fps=30,showinfo",
            "-f",
            "image2pipe",
            "-vcodec",
            "mjpeg",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;

    // PTS lines are window-relative; pairing is by order, which is all the
    // nearest-frame pick needs.
    let stderr = String::from_utf8_lossy(&output.stderr);
    let pts_list: Vec<f64> = stderr.lines().filter_map(parse_pts_line).collect();
    let frames = split_mjpeg_frames(&output.stdout);
    if frames.is_empty() || pts_list.is_empty() {
        debug!(
            video = %video.display(),
            target_pts,
            "high-res window produced no frames"
        );
        return Ok(None);
    }

    let target_rel = target_pts - start;
    let best = frames
        .iter()
        .zip(pts_list.iter())
        .min_by(|(_, a), (_, b)| {
            let da = (*a - target_rel).abs();
            let db = (*b - target_rel).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(frame, _)| frame.to_vec());
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(payload: &[u8]) -> Vec<u8> {
        let mut buf = SOI.to_vec();
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&EOI);
        buf
    }

    #[test]
    fn splits_complete_frames() {
        let mut stream = jpeg(b"one");
        stream.extend(jpeg(b"two"));
        let frames = split_mjpeg_frames(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], jpeg(b"one").as_slice());
        assert_eq!(frames[1], jpeg(b"two").as_slice());
    }

    #[test]
    fn discards_incomplete_trailing_frame() {
        let mut stream = jpeg(b"complete");
        stream.extend_from_slice(&SOI);
        stream.extend_from_slice(b"truncated");
        let frames = split_mjpeg_frames(&stream);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn ignores_garbage_before_first_soi() {
        let mut stream = b"garbage".to_vec();
        stream.extend(jpeg(b"frame"));
        let frames = split_mjpeg_frames(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], jpeg(b"frame").as_slice());
    }

    #[test]
    fn empty_stream_yields_no_frames() {
        assert!(split_mjpeg_frames(&[]).is_empty());
        assert!(split_mjpeg_frames(&SOI).is_empty());
    }
}
