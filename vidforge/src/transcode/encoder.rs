//! Video encoder selection.
//!
//! Candidates are tried in priority order (NVIDIA NVENC, Intel Quick Sync,
//! then libx264) with a tiny synthetic encode. The first usable one is
//! memoised for the life of the selector. A per-job [`QualityPreference`]
//! bypasses probing and is never memoised.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::X264_PRESETS;

/// Hardware/software family of an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EncoderFamily {
    Nvenc,
    Qsv,
    Software,
}

/// Per-user quality preference, used as a per-job encoder override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPreference {
    pub preset: String,
    pub crf: u8,
}

impl QualityPreference {
    pub fn new(preset: impl Into<String>, crf: u8) -> Option<Self> {
        let preset = preset.into();
        (X264_PRESETS.contains(&preset.as_str()) && crf <= 51).then_some(Self { preset, crf })
    }
}

/// An encoder plus the arguments it needs for each encode mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderProfile {
    pub name: String,
    pub family: EncoderFamily,
    pub preset: String,
    pub quality: u8,
}

impl EncoderProfile {
    pub fn nvenc() -> Self {
        Self {
            name: "h264_nvenc".to_string(),
            family: EncoderFamily::Nvenc,
            preset: "p4".to_string(),
            quality: 23,
        }
    }

    pub fn qsv() -> Self {
        Self {
            name: "h264_qsv".to_string(),
            family: EncoderFamily::Qsv,
            preset: "veryfast".to_string(),
            quality: 23,
        }
    }

    pub fn software(preset: impl Into<String>, crf: u8) -> Self {
        Self {
            name: "libx264".to_string(),
            family: EncoderFamily::Software,
            preset: preset.into(),
            quality: crf,
        }
    }

    pub fn from_preference(pref: &QualityPreference) -> Self {
        Self::software(pref.preset.clone(), pref.crf)
    }

    /// Default cascade, fastest first. The software entry is the guaranteed fallback.
    pub fn cascade(software_preset: &str, software_crf: u8) -> Vec<Self> {
        vec![
            Self::nvenc(),
            Self::qsv(),
            Self::software(software_preset, software_crf),
        ]
    }

    fn codec_args(&self, preset: &str) -> Vec<String> {
        let mut args = vec![
            "-c:v".to_string(),
            self.name.clone(),
            "-preset".to_string(),
            preset.to_string(),
        ];
        if self.family != EncoderFamily::Qsv {
            args.extend(["-pix_fmt".to_string(), "yuv420p".to_string()]);
        }
        args
    }

    fn quality_flag(&self) -> &'static str {
        match self.family {
            EncoderFamily::Nvenc => "-cq",
            EncoderFamily::Qsv => "-global_quality",
            EncoderFamily::Software => "-crf",
        }
    }

    /// Constant-quality encode (resolution change, subtitle burn).
    pub fn quality_args(&self) -> Vec<String> {
        let mut args = self.codec_args(&self.preset);
        if self.family == EncoderFamily::Nvenc {
            args.extend(["-rc".to_string(), "vbr".to_string()]);
        }
        args.extend([self.quality_flag().to_string(), self.quality.to_string()]);
        args
    }

    /// Average-bitrate encode with a 1.5x peak and a matching buffer.
    pub fn bitrate_args(&self, video_kbps: u64) -> Vec<String> {
        let peak = video_kbps * 3 / 2;
        let mut args = self.codec_args(&self.preset);
        if self.family == EncoderFamily::Nvenc {
            args.extend(["-rc".to_string(), "vbr".to_string()]);
        }
        args.extend([
            "-b:v".to_string(),
            format!("{video_kbps}k"),
            "-maxrate".to_string(),
            format!("{peak}k"),
            "-bufsize".to_string(),
            format!("{peak}k"),
        ]);
        args
    }

    /// Throwaway fast encode used for pre-normalisation passes.
    pub fn fast_args(&self) -> Vec<String> {
        let preset = match self.family {
            EncoderFamily::Nvenc => "p1",
            EncoderFamily::Qsv => "veryfast",
            EncoderFamily::Software => "ultrafast",
        };
        let mut args = self.codec_args(preset);
        args.extend([self.quality_flag().to_string(), "28".to_string()]);
        args
    }
}

/// "Can this encoder run here?"
#[async_trait]
pub trait EncoderProbe: Send + Sync {
    async fn is_usable(&self, profile: &EncoderProfile) -> bool;
}

/// Probes by encoding a single synthetic frame to the null muxer.
pub struct FfmpegEncoderProbe {
    ffmpeg: String,
    timeout: Duration,
}

impl FfmpegEncoderProbe {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            timeout: Duration::from_secs(15),
        }
    }

    fn args(profile: &EncoderProfile) -> Vec<String> {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-f",
            "lavfi",
            "-i",
            "color=c=black:s=256x144:d=0.1",
            "-frames:v",
            "1",
            "-c:v",
            &profile.name,
            "-f",
            "null",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[async_trait]
impl EncoderProbe for FfmpegEncoderProbe {
    async fn is_usable(&self, profile: &EncoderProfile) -> bool {
        let mut command = process_utils::tokio_command(&self.ffmpeg);
        command
            .args(Self::args(profile))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        match tokio::time::timeout(self.timeout, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(encoder = %profile.name, error = %e, "Encoder probe failed to spawn");
                false
            }
            Err(_) => {
                debug!(encoder = %profile.name, "Encoder probe timed out");
                false
            }
        }
    }
}

/// Memoising encoder cascade.
pub struct EncoderSelector {
    candidates: Vec<EncoderProfile>,
    probe: Arc<dyn EncoderProbe>,
    chosen: OnceCell<EncoderProfile>,
}

impl EncoderSelector {
    /// `candidates` must end with the software encoder, which is never probed.
    pub fn new(candidates: Vec<EncoderProfile>, probe: Arc<dyn EncoderProbe>) -> Self {
        Self {
            candidates,
            probe,
            chosen: OnceCell::new(),
        }
    }

    /// The memoised choice, probing on first use.
    pub async fn select(&self) -> EncoderProfile {
        self.chosen
            .get_or_init(|| async {
                let (last, rest) = match self.candidates.split_last() {
                    Some(split) => split,
                    None => return EncoderProfile::software("fast", 23),
                };
                for candidate in rest {
                    if self.probe.is_usable(candidate).await {
                        info!(encoder = %candidate.name, "Selected hardware encoder");
                        return candidate.clone();
                    }
                }
                info!(encoder = %last.name, "Using software encoder");
                last.clone()
            })
            .await
            .clone()
    }

    /// The override when given, otherwise the memoised choice.
    pub async fn resolve(&self, preference: Option<&QualityPreference>) -> EncoderProfile {
        match preference {
            Some(pref) => EncoderProfile::from_preference(pref),
            None => self.select().await,
        }
    }

    /// The cached choice, if probing already happened.
    pub fn cached(&self) -> Option<&EncoderProfile> {
        self.chosen.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe {
        usable: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EncoderProbe for FakeProbe {
        async fn is_usable(&self, profile: &EncoderProfile) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.usable.contains(&profile.name.as_str())
        }
    }

    fn selector(usable: Vec<&'static str>) -> (EncoderSelector, Arc<FakeProbe>) {
        let probe = Arc::new(FakeProbe {
            usable,
            calls: AtomicUsize::new(0),
        });
        let selector = EncoderSelector::new(EncoderProfile::cascade("fast", 23), probe.clone());
        (selector, probe)
    }

    #[tokio::test]
    async fn test_first_usable_wins_and_is_memoised() {
        let (selector, probe) = selector(vec!["h264_qsv"]);
        assert_eq!(selector.select().await.name, "h264_qsv");
        assert_eq!(selector.select().await.name, "h264_qsv");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_software_fallback_is_not_probed() {
        let (selector, probe) = selector(vec![]);
        let chosen = selector.select().await;
        assert_eq!(chosen.family, EncoderFamily::Software);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_override_bypasses_cache() {
        let (selector, probe) = selector(vec!["h264_nvenc"]);
        let pref = QualityPreference::new("ultrafast", 30).unwrap();
        let chosen = selector.resolve(Some(&pref)).await;
        assert_eq!(chosen, EncoderProfile::software("ultrafast", 30));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert!(selector.cached().is_none());

        assert_eq!(selector.resolve(None).await.name, "h264_nvenc");
        assert_eq!(selector.cached().unwrap().name, "h264_nvenc");
    }

    #[test]
    fn test_quality_args() {
        let args = EncoderProfile::software("fast", 23).quality_args();
        assert_eq!(
            args,
            vec!["-c:v", "libx264", "-preset", "fast", "-pix_fmt", "yuv420p", "-crf", "23"]
        );
        let nv = EncoderProfile::nvenc().quality_args();
        assert!(nv.windows(2).any(|w| w == ["-cq", "23"]));
    }

    #[test]
    fn test_bitrate_args_cap_peak() {
        let args = EncoderProfile::software("fast", 23).bitrate_args(1000);
        assert!(args.windows(2).any(|w| w == ["-b:v", "1000k"]));
        assert!(args.windows(2).any(|w| w == ["-maxrate", "1500k"]));
        assert!(args.windows(2).any(|w| w == ["-bufsize", "1500k"]));
        assert!(!args.contains(&"-crf".to_string()));
    }

    #[test]
    fn test_quality_preference_validation() {
        assert!(QualityPreference::new("medium", 18).is_some());
        assert!(QualityPreference::new("ludicrous", 18).is_none());
        assert!(QualityPreference::new("fast", 60).is_none());
    }
}
