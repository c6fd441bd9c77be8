//! Subtitle normalisation and the burn-in filter.

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::probe::MediaInfo;
use super::runner::run_capture;
use crate::cleanup::{JobPaths, TempPath};
use crate::utils::filename::extension_of;
use crate::{Error, Result};

/// Style applied to every burned subtitle.
pub const FORCE_STYLE: &str = "FontName=Arial,FontSize=24,PrimaryColour=&H00FFFFFF,\
OutlineColour=&H00000000,BorderStyle=1,Outline=2,Shadow=1";

/// Above this height the source is shrunk before burning.
pub const PRENORMALIZE_MAX_HEIGHT: u32 = 1080;
/// Above this overall bitrate (bits/s) the source is shrunk before burning.
pub const PRENORMALIZE_MAX_BITRATE: u64 = 8_000_000;
/// Codecs whose decode cost dominates the burn pass.
pub const EXPENSIVE_CODECS: &[&str] = &["hevc", "av1", "vp9", "prores"];
/// Height the pre-normalisation pass scales down to.
pub const PRENORMALIZE_HEIGHT: u32 = 720;

/// Escape a value for use inside a single-quoted filter option.
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// `subtitles` filter for a file name relative to ffmpeg's working directory.
pub fn burn_filter(subtitle_file_name: &str) -> String {
    format!(
        "subtitles=filename='{}':force_style='{}'",
        escape_filter_value(subtitle_file_name),
        FORCE_STYLE
    )
}

/// Scale filter for the pre-normalisation pass: height capped, width even.
pub fn prenormalize_filter() -> String {
    format!("scale=-2:'min({PRENORMALIZE_HEIGHT},ih)'")
}

/// Whether shrinking the source first pays off.
pub fn needs_prenormalize(info: &MediaInfo) -> bool {
    let Some(video) = info.video_stream() else {
        return false;
    };
    let too_tall = video.height.is_some_and(|h| h > PRENORMALIZE_MAX_HEIGHT);
    let bitrate = info.bit_rate.or(video.bit_rate).unwrap_or(0);
    let expensive = EXPENSIVE_CODECS.contains(&video.codec.as_str());
    too_tall || bitrate > PRENORMALIZE_MAX_BITRATE || expensive
}

/// Place the subtitle next to the job's other files as `{jobId}_subs.srt`.
///
/// Non-SRT input is converted with ffmpeg; if that fails the original is
/// copied verbatim as `{jobId}_subs{ext}` and libass gets to deal with it.
pub async fn normalize_subtitle(
    ffmpeg: &str,
    source: &Path,
    paths: &JobPaths,
    cancel: &CancellationToken,
) -> Result<TempPath> {
    let ext = extension_of(&source.to_string_lossy());
    let srt = TempPath::new(paths.file("subs", ".srt"));

    if ext == ".srt" {
        copy(source, srt.path()).await?;
        return Ok(srt);
    }

    let mut command = process_utils::tokio_command(ffmpeg);
    command
        .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
        .arg(source)
        .arg(srt.path());
    match run_capture(command, cancel).await {
        Ok(output) if output.status.success() => {
            if non_empty(srt.path()).await {
                debug!(from = %ext, "Converted subtitle to srt");
                return Ok(srt);
            }
            warn!("Subtitle conversion produced no cues, using original file");
        }
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e @ Error::ToolUnavailable(_)) => return Err(e),
        Ok(output) => warn!(
            code = ?output.status.code(),
            "Subtitle conversion failed, using original file"
        ),
        Err(e) => warn!(error = %e, "Subtitle conversion failed, using original file"),
    }
    drop(srt);

    let verbatim = TempPath::new(paths.file("subs", if ext.is_empty() { ".srt" } else { &ext }));
    copy(source, verbatim.path()).await?;
    Ok(verbatim)
}

async fn copy(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(|e| Error::io_path("copying subtitle to", to, e))
}

async fn non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.len() > 0)
}
