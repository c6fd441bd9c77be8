//! Bitrate planning for size-targeted compression.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Audio bitrate reserved in every size-targeted encode.
pub const AUDIO_BITRATE_KBPS: u64 = 128;
/// Below this the output is not worth producing.
pub const MIN_VIDEO_BITRATE_KBPS: u64 = 80;
/// Share of the target left for the streams; the rest is container overhead.
pub const SIZE_HEADROOM: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionPlan {
    pub target_bytes: u64,
    pub duration_secs: f64,
    pub video_kbps: u64,
    pub minimum_viable_bytes: u64,
}

impl CompressionPlan {
    /// `video = target * 8 * 0.95 / duration - audio`, rejected below the floor.
    pub fn compute(duration_secs: f64, target_bytes: u64) -> Result<Self> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(Error::unsupported("cannot compress a video with unknown duration"));
        }

        let total_kbps = target_bytes as f64 * 8.0 * SIZE_HEADROOM / duration_secs / 1000.0;
        let video_kbps = total_kbps - AUDIO_BITRATE_KBPS as f64;
        let minimum_viable_bytes = minimum_viable_bytes(duration_secs);

        if video_kbps < MIN_VIDEO_BITRATE_KBPS as f64 {
            return Err(Error::TargetTooSmall {
                minimum_bytes: minimum_viable_bytes,
            });
        }

        Ok(Self {
            target_bytes,
            duration_secs,
            video_kbps: video_kbps.floor() as u64,
            minimum_viable_bytes,
        })
    }
}

/// Smallest target whose video bitrate reaches the floor.
pub fn minimum_viable_bytes(duration_secs: f64) -> u64 {
    let kbps = (MIN_VIDEO_BITRATE_KBPS + AUDIO_BITRATE_KBPS) as f64;
    (kbps * 1000.0 * duration_secs / 8.0 / SIZE_HEADROOM).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_longer_duration_needs_lower_bitrate() {
        let short = CompressionPlan::compute(60.0, 10 * MB).unwrap();
        let long = CompressionPlan::compute(120.0, 10 * MB).unwrap();
        assert!(long.video_kbps < short.video_kbps);
    }

    #[test]
    fn test_formula() {
        // 10 MiB over 60s: 10485760 * 8 * 0.95 / 60 / 1000 = 1328.19 kbps total.
        let plan = CompressionPlan::compute(60.0, 10 * MB).unwrap();
        assert_eq!(plan.video_kbps, 1200);
        assert_eq!(plan.target_bytes, 10 * MB);
    }

    #[test]
    fn test_target_too_small() {
        let err = CompressionPlan::compute(3600.0, MB).unwrap_err();
        match err {
            Error::TargetTooSmall { minimum_bytes } => {
                assert_eq!(minimum_bytes, minimum_viable_bytes(3600.0));
                assert!(minimum_bytes > MB);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_minimum_is_achievable() {
        let duration = 600.0;
        let min = minimum_viable_bytes(duration);
        assert!(CompressionPlan::compute(duration, min).is_ok());
        assert!(CompressionPlan::compute(duration, min - 1000).is_err());
    }

    #[test]
    fn test_unknown_duration() {
        assert!(matches!(
            CompressionPlan::compute(0.0, 10 * MB),
            Err(Error::UnsupportedFormat(_))
        ));
    }
}
