//! Image and video derivation through `ffmpeg`/`ffprobe`.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::Path;
use tokio::process::Command;

use crate::error::{PlanetError, Result};

#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Pixel width and height of an image.
    async fn dimensions(&self, path: &Path) -> Result<(u32, u32)>;

    /// Center-crop `src` to a square and scale it to `size` pixels.
    async fn square_grid(&self, src: &Path, dest: &Path, size: u32) -> Result<()>;

    /// Still frame from the start of a video.
    async fn video_thumbnail(&self, video: &Path, dest: &Path) -> Result<()>;

    /// Cover card for a text-only post.
    async fn render_cover(&self, title: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FfmpegMedia {
    ffmpeg: String,
    ffprobe: String,
}

impl Default for FfmpegMedia {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        }
    }
}

/// Ensure `ffmpeg` is on PATH by invoking `ffmpeg -version`.
pub async fn ensure_ffmpeg_available() -> Result<()> {
    let status = Command::new("ffmpeg")
        .arg("-version")
        .kill_on_drop(true)
        .status()
        .await;
    match status {
        Ok(s) if s.success() => Ok(()),
        Ok(s) => Err(PlanetError::Media(format!("ffmpeg not available (exit status {s})"))),
        Err(e) => Err(PlanetError::Media(format!("ffmpeg not available: {e}"))),
    }
}

/// Escape text for the `drawtext` filter.
fn drawtext_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | '\'' | ':' | '%' | ',' => {
                out.push('\\');
                out.push(c);
            }
            '\n' | '\r' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

fn parse_dimensions(stdout: &str) -> Option<(u32, u32)> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let (w, h) = line.trim().split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

impl FfmpegMedia {
    async fn ffmpeg(&self, args: &[&OsStr], what: &Path) -> Result<()> {
        if let Some(parent) = what.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PlanetError::persistence(parent, e))?;
        }
        let status = Command::new(&self.ffmpeg)
            .arg("-y")
            .arg("-loglevel")
            .arg("error")
            .args(args)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| PlanetError::Media(format!("failed to spawn ffmpeg for {}: {e}", what.display())))?;
        if !status.success() {
            return Err(PlanetError::Media(format!(
                "ffmpeg exited with status {} for {}",
                status,
                what.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaProcessor for FfmpegMedia {
    async fn dimensions(&self, path: &Path) -> Result<(u32, u32)> {
        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height")
            .arg("-of")
            .arg("csv=s=x:p=0")
            .arg(path.as_os_str())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PlanetError::Media(format!("failed to spawn ffprobe: {e}")))?;
        if !output.status.success() {
            return Err(PlanetError::Media(format!(
                "ffprobe exited with status {} for {}",
                output.status,
                path.display()
            )));
        }
        parse_dimensions(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| PlanetError::Media(format!("no dimensions for {}", path.display())))
    }

    async fn square_grid(&self, src: &Path, dest: &Path, size: u32) -> Result<()> {
        let filter = format!("crop='min(iw,ih)':'min(iw,ih)',scale={size}:{size}:flags=lanczos");
        self.ffmpeg(
            &[
                OsStr::new("-i"),
                src.as_os_str(),
                OsStr::new("-frames:v"),
                OsStr::new("1"),
                OsStr::new("-vf"),
                OsStr::new(&filter),
                dest.as_os_str(),
            ],
            dest,
        )
        .await
    }

    async fn video_thumbnail(&self, video: &Path, dest: &Path) -> Result<()> {
        // First frame after a short seek, scaled to a max width of 1280.
        self.ffmpeg(
            &[
                OsStr::new("-ss"),
                OsStr::new("0.25"),
                OsStr::new("-i"),
                video.as_os_str(),
                OsStr::new("-frames:v"),
                OsStr::new("1"),
                OsStr::new("-vf"),
                OsStr::new("scale='min(1280,iw)':-2:flags=lanczos"),
                dest.as_os_str(),
            ],
            dest,
        )
        .await
    }

    async fn render_cover(&self, title: &str, dest: &Path) -> Result<()> {
        let filter = format!(
            "drawtext=text='{}':fontcolor=white:fontsize=56:x=(w-text_w)/2:y=(h-text_h)/2",
            drawtext_escape(title)
        );
        self.ffmpeg(
            &[
                OsStr::new("-f"),
                OsStr::new("lavfi"),
                OsStr::new("-i"),
                OsStr::new("color=c=0x1f2937:s=1200x1200"),
                OsStr::new("-frames:v"),
                OsStr::new("1"),
                OsStr::new("-vf"),
                OsStr::new(&filter),
                dest.as_os_str(),
            ],
            dest,
        )
        .await
    }
}
