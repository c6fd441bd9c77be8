//! Media inspection through `ffprobe -print_format json`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;

use super::runner::{DIAGNOSTIC_TAIL_CHARS, run_capture};
use crate::utils::format::{format_elapsed, format_size, tail_chars};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    channels: Option<u32>,
    bit_rate: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub channels: Option<u32>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub bit_rate: Option<u64>,
}

impl StreamInfo {
    /// One-line description for pick lists, e.g. `#1 audio aac 2ch [eng]`.
    pub fn summary(&self) -> String {
        let mut out = format!("#{} {} {}", self.index, self.kind, self.codec);
        if let (Some(w), Some(h)) = (self.width, self.height) {
            let _ = write!(out, " {w}x{h}");
        }
        if let Some(ch) = self.channels {
            let _ = write!(out, " {ch}ch");
        }
        if let Some(lang) = &self.language {
            let _ = write!(out, " [{lang}]");
        }
        if let Some(title) = &self.title {
            let _ = write!(out, " {title}");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub container: String,
    pub duration_secs: f64,
    pub bit_rate: Option<u64>,
    pub size_bytes: Option<u64>,
    pub streams: Vec<StreamInfo>,
}

impl MediaInfo {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: FfprobeOutput = serde_json::from_str(json)?;
        if raw.streams.is_empty() {
            return Err(Error::unsupported("no media streams found"));
        }

        let format = raw.format;
        let parse_f64 = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<f64>().ok());
        let parse_u64 = |v: &Option<String>| v.as_deref().and_then(|s| s.parse::<u64>().ok());

        let stream_duration = raw
            .streams
            .iter()
            .filter_map(|s| parse_f64(&s.duration))
            .fold(0.0_f64, f64::max);
        let duration_secs = format
            .as_ref()
            .and_then(|f| parse_f64(&f.duration))
            .filter(|d| *d > 0.0)
            .unwrap_or(stream_duration);

        let streams = raw
            .streams
            .into_iter()
            .map(|s| StreamInfo {
                index: s.index,
                kind: match s.codec_type.as_deref() {
                    Some("video") => StreamKind::Video,
                    Some("audio") => StreamKind::Audio,
                    Some("subtitle") => StreamKind::Subtitle,
                    _ => StreamKind::Other,
                },
                codec: s.codec_name.unwrap_or_else(|| "unknown".to_string()),
                width: s.width,
                height: s.height,
                channels: s.channels,
                language: s.tags.get("language").cloned(),
                title: s.tags.get("title").cloned(),
                bit_rate: parse_u64(&s.bit_rate),
            })
            .collect();

        Ok(Self {
            container: format
                .as_ref()
                .and_then(|f| f.format_name.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            duration_secs,
            bit_rate: format.as_ref().and_then(|f| parse_u64(&f.bit_rate)),
            size_bytes: format.as_ref().and_then(|f| parse_u64(&f.size)),
            streams,
        })
    }

    /// First video stream that is not an attached picture.
    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams
            .iter()
            .find(|s| s.kind == StreamKind::Video && !matches!(s.codec.as_str(), "mjpeg" | "png"))
    }

    /// Audio and subtitle streams, the candidates for extraction.
    pub fn extractable_streams(&self) -> Vec<StreamInfo> {
        self.streams
            .iter()
            .filter(|s| matches!(s.kind, StreamKind::Audio | StreamKind::Subtitle))
            .cloned()
            .collect()
    }

    pub fn stream(&self, index: u32) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }

    /// Human-readable report.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Container: {}", self.container);
        let _ = writeln!(
            out,
            "Duration: {}",
            format_elapsed(std::time::Duration::from_secs_f64(self.duration_secs.max(0.0)))
        );
        if let Some(size) = self.size_bytes {
            let _ = writeln!(out, "Size: {}", format_size(size));
        }
        if let Some(bps) = self.bit_rate {
            let _ = writeln!(out, "Bitrate: {} kb/s", bps / 1000);
        }
        for kind in [StreamKind::Video, StreamKind::Audio, StreamKind::Subtitle] {
            let streams: Vec<_> = self.streams.iter().filter(|s| s.kind == kind).collect();
            if streams.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{} streams:", capitalize(&kind.to_string()));
            for s in streams {
                let _ = writeln!(out, "  {}", s.summary());
            }
        }
        out.trim_end().to_string()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Run ffprobe on `path`.
pub async fn probe_media(
    ffprobe: &str,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<MediaInfo> {
    let mut command = process_utils::tokio_command(ffprobe);
    command
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path);

    let output = run_capture(command, cancel).await?;
    if !output.status.success() {
        return Err(Error::ProcessFailed {
            code: output.status.code(),
            diagnostic: tail_chars(
                &String::from_utf8_lossy(&output.stderr),
                DIAGNOSTIC_TAIL_CHARS,
            ),
        });
    }
    MediaInfo::from_json(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
             "bit_rate": "4500000", "duration": "120.5"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac", "channels": 2,
             "tags": {"language": "eng", "title": "Stereo"}},
            {"index": 2, "codec_type": "subtitle", "codec_name": "subrip", "tags": {"language": "fre"}},
            {"index": 3, "codec_type": "video", "codec_name": "mjpeg", "width": 320, "height": 240}
        ],
        "format": {"format_name": "matroska,webm", "duration": "120.520000",
                   "bit_rate": "4700000", "size": "70800000"}
    }"#;

    #[test]
    fn test_parse_sample() {
        let info = MediaInfo::from_json(SAMPLE).unwrap();
        assert_eq!(info.container, "matroska,webm");
        assert!((info.duration_secs - 120.52).abs() < 1e-9);
        assert_eq!(info.bit_rate, Some(4_700_000));
        assert_eq!(info.streams.len(), 4);

        let video = info.video_stream().unwrap();
        assert_eq!((video.width, video.height), (Some(1920), Some(1080)));

        let extractable = info.extractable_streams();
        assert_eq!(extractable.len(), 2);
        assert_eq!(extractable[0].language.as_deref(), Some("eng"));
        assert_eq!(extractable[1].kind, StreamKind::Subtitle);
    }

    #[test]
    fn test_duration_falls_back_to_streams() {
        let json = r#"{"streams": [{"index": 0, "codec_type": "audio", "codec_name": "mp3",
                        "duration": "33.0"}], "format": {"format_name": "mp3"}}"#;
        let info = MediaInfo::from_json(json).unwrap();
        assert_eq!(info.duration_secs, 33.0);
    }

    #[test]
    fn test_no_streams_is_unsupported() {
        let err = MediaInfo::from_json(r#"{"streams": [], "format": {}}"#).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn test_report() {
        let report = MediaInfo::from_json(SAMPLE).unwrap().report();
        assert!(report.contains("Container: matroska,webm"));
        assert!(report.contains("Duration: 2m 0s"));
        assert!(report.contains("Audio streams:"));
        assert!(report.contains("#1 audio aac 2ch [eng] Stereo"));
        assert!(report.contains("#2 subtitle subrip [fre]"));
    }
}
