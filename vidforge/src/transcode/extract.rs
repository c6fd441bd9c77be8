//! Single-stream extraction targets.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use super::probe::StreamKind;

/// Output format for an extracted stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ExtractFormat {
    Mp3,
    #[strum(to_string = "aac", serialize = "m4a")]
    Aac,
    Flac,
    Opus,
    #[strum(to_string = "srt", serialize = "subrip")]
    Srt,
    #[strum(to_string = "ass", serialize = "ssa")]
    Ass,
    #[strum(to_string = "vtt", serialize = "webvtt")]
    Vtt,
}

impl ExtractFormat {
    pub fn stream_kind(&self) -> StreamKind {
        match self {
            Self::Mp3 | Self::Aac | Self::Flac | Self::Opus => StreamKind::Audio,
            Self::Srt | Self::Ass | Self::Vtt => StreamKind::Subtitle,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => ".mp3",
            Self::Aac => ".m4a",
            Self::Flac => ".flac",
            Self::Opus => ".opus",
            Self::Srt => ".srt",
            Self::Ass => ".ass",
            Self::Vtt => ".vtt",
        }
    }

    /// Codec arguments. Audio is transcoded, subtitles are converted by the muxer.
    pub fn codec_args(&self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::Mp3 => &["-c:a", "libmp3lame", "-b:a", "192k"],
            Self::Aac => &["-c:a", "aac", "-b:a", "192k"],
            Self::Flac => &["-c:a", "flac"],
            Self::Opus => &["-c:a", "libopus", "-b:a", "128k"],
            Self::Srt => &["-c:s", "srt"],
            Self::Ass => &["-c:s", "ass"],
            Self::Vtt => &["-c:s", "webvtt"],
        };
        args.iter().map(|s| s.to_string()).collect()
    }

    /// Formats a stream of `kind` can be extracted to.
    pub fn available_for(kind: StreamKind) -> Vec<Self> {
        Self::iter().filter(|f| f.stream_kind() == kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(ExtractFormat::from_str("MP3").unwrap(), ExtractFormat::Mp3);
        assert_eq!(ExtractFormat::from_str("m4a").unwrap(), ExtractFormat::Aac);
        assert_eq!(ExtractFormat::from_str("webvtt").unwrap(), ExtractFormat::Vtt);
        assert!(ExtractFormat::from_str("wav").is_err());
        assert_eq!(ExtractFormat::Aac.to_string(), "aac");
    }

    #[test]
    fn test_available_for() {
        let audio = ExtractFormat::available_for(StreamKind::Audio);
        assert_eq!(audio.len(), 4);
        assert!(audio.iter().all(|f| f.stream_kind() == StreamKind::Audio));
        assert!(ExtractFormat::available_for(StreamKind::Video).is_empty());
    }

    #[test]
    fn test_codec_args() {
        assert_eq!(
            ExtractFormat::Opus.codec_args(),
            vec!["-c:a", "libopus", "-b:a", "128k"]
        );
        assert_eq!(ExtractFormat::Vtt.codec_args(), vec!["-c:s", "webvtt"]);
        assert_eq!(ExtractFormat::Aac.extension(), ".m4a");
    }
}
