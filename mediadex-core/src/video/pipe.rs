//! The persistent decode pipe. One ffmpeg child per asset attempt emits raw
//! RGB24 frames at 1 fps on stdout while a showinfo filter reports one PTS
//! line per frame on stderr. The two byte streams are asynchronous; pairing
//! them is this module's whole job.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{MediadexError, Result};
use crate::video::ffprobe;

/// Frames are scaled to this width; height follows the aspect ratio, forced
/// even so our byte math and ffmpeg's agree.
pub const OUT_WIDTH: u32 = 480;
/// How long to wait for a PTS once a full frame's pixels have arrived.
/// Beyond this the streams are considered desynchronized.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(10);
/// Tolerated shortfall between the last observed PTS and the container
/// duration: one 1 fps cadence interval plus seek slack.
pub const TRUNCATION_EPSILON: f64 = 2.5;

const STDERR_TAIL_LINES: usize = 40;
const PTS_QUEUE_DEPTH: usize = 64;

static PTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"pts_time:([0-9.]+)").expect("pts regex"));

pub fn parse_pts_line(line: &str) -> Option<f64> {
    if !line.contains("showinfo") || !line.contains("pts_time:") {
        return None;
    }
    PTS_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Even output height preserving aspect ratio at [`OUT_WIDTH`].
pub fn output_height(src_width: u32, src_height: u32) -> u32 {
    let scaled = (OUT_WIDTH as u64 * src_height as u64) / src_width as u64;
    ((scaled / 2) * 2).max(2) as u32
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub bytes: Vec<u8>,
    /// Absolute presentation timestamp in seconds (seek offset included).
    pub pts: f64,
}

pub struct FrameStream {
    _child: Child,
    stdout: ChildStdout,
    pts_rx: mpsc::Receiver<f64>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    width: u32,
    height: u32,
    frame_len: usize,
    seek_offset: f64,
    duration: Option<f64>,
    last_pts: f64,
    frames_read: u64,
    repro: String,
}

impl FrameStream {
    /// Probe the source and start the decoder. `seek_to` uses input seek;
    /// PTS values handed out by [`Self::next_frame`] are shifted back to the
    /// source timeline.
    pub async fn open(input: &Path, seek_to: Option<f64>, hwaccel: bool) -> Result<Self> {
        let dims = ffprobe::dimensions(input).await?;
        let duration = ffprobe::duration(input).await?;
        let height = output_height(dims.width, dims.height);
        let frame_len = (OUT_WIDTH * height * 3) as usize;
        let seek_offset = seek_to.unwrap_or(0.0);

        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "info".into()];
        if hwaccel {
            args.push("-hwaccel".into());
            args.push("auto".into());
        }
        if let Some(seek) = seek_to {
            args.push("-ss".into());
            args.push(format!("{seek}"));
        }
        args.push("-i".into());
        args.push(input.to_string_lossy().into_owned());
        args.push("-vf".into());
        args.push(format!("fps=1,scale={OUT_WIDTH}:{height},showinfo"));
        args.extend(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"].map(String::from));
        let repro = format!("ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (pts_tx, pts_rx) = mpsc::channel(PTS_QUEUE_DEPTH);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut tail = tail.lock().expect("stderr tail lock");
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
                if let Some(pts) = parse_pts_line(&line) {
                    if pts_tx.send(pts).await.is_err() {
                        break;
                    }
                }
            }
            // tx drops here; a closed channel tells the consumer the
            // metadata stream ended cleanly.
        });

        debug!(input = %input.display(), ?seek_to, hwaccel, "decode pipe started");
        Ok(Self {
            _child: child,
            stdout,
            pts_rx,
            stderr_tail,
            width: OUT_WIDTH,
            height,
            frame_len,
            seek_offset,
            duration,
            last_pts: seek_offset - 1.0,
            frames_read: 0,
            repro,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn repro(&self) -> String {
        self.repro.clone()
    }

    pub fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().expect("stderr tail lock");
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Read one paired `(pixels, pts)` frame, or `None` at end of stream.
    ///
    /// The pairing contract: exactly `width * height * 3` bytes are read,
    /// then exactly one PTS is popped from the metadata queue. A PTS that
    /// does not arrive within [`PAIRING_TIMEOUT`] is a fatal
    /// desynchronization for this attempt. When the metadata stream has
    /// ended cleanly but pixels keep coming, PTS values are synthesized at
    /// the 1 fps cadence.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut bytes = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return self.check_complete().map(|_| None);
            }
            Err(e) => return Err(e.into()),
        }

        let pts = match timeout(PAIRING_TIMEOUT, self.pts_rx.recv()).await {
            Ok(Some(rel_pts)) => rel_pts + self.seek_offset,
            // Metadata stream closed cleanly; fall back to cadence.
            Ok(None) => self.last_pts + 1.0,
            Err(_) => {
                return Err(MediadexError::Desync(format!(
                    "no PTS within {}s of receiving frame pixels (ffmpeg hung or stderr reader died); repro: {}",
                    PAIRING_TIMEOUT.as_secs(),
                    self.repro
                )));
            }
        };
        self.last_pts = pts;
        self.frames_read += 1;
        Ok(Some(Frame { bytes, pts }))
    }

    /// End-of-stream completion check: if the decoder stopped short of the
    /// container duration the run is truncated, never successful.
    fn check_complete(&self) -> Result<()> {
        if self.frames_read == 0 {
            // Nothing decoded; the caller decides between retry and poison.
            return Ok(());
        }
        if let Some(expected) = self.duration {
            if self.last_pts + TRUNCATION_EPSILON < expected {
                return Err(MediadexError::Truncated {
                    expected,
                    observed: self.last_pts,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_showinfo_pts_lines() {
        let line = "[Parsed_showinfo_2 @ 0x55d] n:   4 pts:  4004 pts_time:4.171 duration:...";
        assert_eq!(parse_pts_line(line), Some(4.171));
        assert_eq!(parse_pts_line("frame=  100 fps= 25"), None);
        assert_eq!(parse_pts_line("[showinfo] pts_time:bogus"), None);
    }

    #[test]
    fn output_height_is_even_and_aspect_preserving() {
        assert_eq!(output_height(1920, 1080), 270);
        assert_eq!(output_height(1280, 720), 270);
        // 853.33 tall portrait clip: 480 * 1920 / 1080 = 853 -> 852
        assert_eq!(output_height(1080, 1920), 852);
        assert_eq!(output_height(4096, 10), 2);
    }
}
