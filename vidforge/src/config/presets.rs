//! Fixed tables: resolution presets, recognised extensions and limits.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Named resolution targets offered to users, smallest first.
pub const RESOLUTION_PRESETS: &[(&str, u32, u32)] = &[
    ("360p", 640, 360),
    ("480p", 854, 480),
    ("720p", 1280, 720),
    ("1080p", 1920, 1080),
    ("1440p", 2560, 1440),
    ("4K", 3840, 2160),
];

pub const SUBTITLE_EXTENSIONS: &[&str] = &[".srt", ".ass", ".ssa", ".vtt", ".sub", ".txt"];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mp4", ".mkv", ".avi", ".mov", ".webm", ".flv", ".ts", ".m4v", ".3gp",
];

/// Accepted compression targets, in megabytes.
pub const COMPRESS_TARGET_MB: std::ops::RangeInclusive<u64> = 1..=4096;

pub const X264_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

/// Exact output frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDims {
    pub width: u32,
    pub height: u32,
}

impl TargetDims {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Accepts a preset label (`720p`, `4k`) or explicit `WxH` / `W:H`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Some((_, w, h)) = RESOLUTION_PRESETS
            .iter()
            .find(|(label, _, _)| label.eq_ignore_ascii_case(input))
        {
            return Ok(Self::new(*w, *h));
        }

        let (w, h) = input
            .split_once(['x', 'X', ':'])
            .ok_or_else(|| Error::unsupported(format!("resolution '{input}'")))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| Error::unsupported(format!("resolution '{input}'")))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| Error::unsupported(format!("resolution '{input}'")))?;
        // libx264 rejects odd dimensions with yuv420p.
        if width < 16 || height < 16 || width > 7680 || height > 4320 || width % 2 + height % 2 != 0
        {
            return Err(Error::unsupported(format!("resolution '{input}'")));
        }
        Ok(Self::new(width, height))
    }

    /// Preset label if these dims match one, e.g. `720p`.
    pub fn label(&self) -> Option<&'static str> {
        RESOLUTION_PRESETS
            .iter()
            .find(|(_, w, h)| *w == self.width && *h == self.height)
            .map(|(label, _, _)| *label)
    }
}

impl fmt::Display for TargetDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Map a `Content-Type` to a container extension.
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "video/mp4" => Some(".mp4"),
        "video/x-matroska" => Some(".mkv"),
        "video/x-msvideo" => Some(".avi"),
        "video/webm" => Some(".webm"),
        "video/quicktime" => Some(".mov"),
        "video/x-flv" => Some(".flv"),
        "video/mp2t" => Some(".ts"),
        "video/3gpp" => Some(".3gp"),
        _ => None,
    }
}

pub fn is_video_extension(ext: &str) -> bool {
    VIDEO_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

pub fn is_subtitle_extension(ext: &str) -> bool {
    SUBTITLE_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext))
}
