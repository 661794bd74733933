use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{MediadexError, Result};

#[derive(Clone, Copy, Debug)]
pub struct VideoDimensions {
    pub width: u32,
    pub height: u32,
}

async fn run_ffprobe(args: &[&str]) -> Result<String> {
    let output = Command::new("ffprobe")
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(MediadexError::Transient(format!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Width and height of the first video stream.
pub async fn dimensions(input: &Path) -> Result<VideoDimensions> {
    let path = input.to_string_lossy();
    let stdout = run_ffprobe(&[
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height",
        "-of",
        "csv=p=0",
        path.as_ref(),
    ])
    .await?;
    let line = stdout.trim();
    if line.is_empty() {
        return Err(MediadexError::Poison(format!(
            "ffprobe returned no stream for {}",
            input.display()
        )));
    }
    parse_dimensions(line).ok_or_else(|| {
        MediadexError::Poison(format!("ffprobe unexpected output for {}: {line:?}", input.display()))
    })
}

fn parse_dimensions(line: &str) -> Option<VideoDimensions> {
    let mut parts = line.split(',');
    let width: u32 = parts.next()?.trim().parse().ok()?;
    let height: u32 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || width == 0 || height == 0 {
        return None;
    }
    Some(VideoDimensions { width, height })
}

/// Container duration in seconds, or None when the container does not report
/// one.
pub async fn duration(input: &Path) -> Result<Option<f64>> {
    let path = input.to_string_lossy();
    let stdout = run_ffprobe(&[
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        path.as_ref(),
    ])
    .await?;
    Ok(stdout.trim().parse::<f64>().ok().filter(|d| d.is_finite() && *d > 0.0))
}
