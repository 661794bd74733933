//! Short-lived ffmpeg invocations (transcode, thumbnail, stream copy) with
//! enough captured context that every failure message carries a copy/paste
//! repro command and the stderr tail.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::Result;

const STDERR_TAIL_LINES: usize = 40;

/// One completed ffmpeg run.
#[derive(Clone, Debug)]
pub struct FfmpegAttempt {
    pub args: Vec<OsString>,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl FfmpegAttempt {
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Shell-safe repro line for copy/paste.
    pub fn repro(&self) -> String {
        let mut out = String::from("ffmpeg");
        for arg in &self.args {
            let s = arg.to_string_lossy();
            out.push(' ');
            if s.chars().all(|c| c.is_ascii_alphanumeric() || "-_=./:".contains(c)) {
                out.push_str(&s);
            } else {
                out.push('\'');
                out.push_str(&s.replace('\'', "'\\''"));
                out.push('\'');
            }
        }
        out
    }

    pub fn stderr_tail(&self) -> String {
        tail_lines(&self.stderr, STDERR_TAIL_LINES)
    }

    /// Error text in the shape the flight log and error_message expect.
    pub fn describe_failure(&self, label: &str) -> String {
        let tail = self.stderr_tail();
        if tail.is_empty() {
            format!("{label}\nRepro: {}", self.repro())
        } else {
            format!("{label}\nRepro: {}\nffmpeg stderr tail:\n{tail}", self.repro())
        }
    }
}

pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n").trim().to_string()
}

pub async fn run(args: Vec<OsString>) -> Result<FfmpegAttempt> {
    let output = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await?;
    Ok(FfmpegAttempt {
        args,
        exit_code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn os_args<const N: usize>(parts: [&str; N]) -> Vec<OsString> {
    parts.iter().map(OsString::from).collect()
}

/// One-shot 720p H.264 transcode into the ephemeral working file the rest of
/// the video pipeline reads. This is the single read of the source.
pub async fn transcode_720p(source: &Path, dest: &Path) -> Result<FfmpegAttempt> {
    let mut args = os_args(["-hide_banner", "-y", "-i"]);
    args.push(source.into());
    args.extend(os_args([
        "-vf",
        "scale=-2:720",
        "-c:v",
        "libx264",
        "-preset",
        "fast",
        "-crf",
        "23",
        "-c:a",
        "aac",
        "-movflags",
        "+faststart",
    ]));
    args.push(dest.into());
    run(args).await
}

/// Grab one frame as a JPEG.
pub async fn extract_frame_jpeg(source: &Path, dest: &Path, at_secs: f64) -> Result<FfmpegAttempt> {
    let mut args = os_args(["-hide_banner", "-y", "-ss"]);
    args.push(format!("{at_secs}").into());
    args.push("-i".into());
    args.push(source.into());
    args.extend(os_args(["-frames:v", "1", "-q:v", "3"]));
    args.push(dest.into());
    run(args).await
}

/// Stream-copy the first `duration` seconds (the head clip). No re-encode.
pub async fn copy_head_clip(source: &Path, dest: &Path, duration: f64) -> Result<FfmpegAttempt> {
    let mut args = os_args(["-hide_banner", "-y", "-i"]);
    args.push(source.into());
    args.push("-t".into());
    args.push(format!("{duration}").into());
    args.extend(os_args(["-c", "copy", "-movflags", "+faststart"]));
    args.push(dest.into());
    run(args).await
}
