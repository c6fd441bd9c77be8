//! Transcode engine.
//!
//! Every operation takes a local input file, runs ffmpeg with a constructed
//! argument set and returns the output wrapped in a [`TempPath`]; intermediate
//! files are owned by guards local to the operation and vanish when it returns.

pub mod compress;
pub mod encoder;
pub mod extract;
pub mod probe;
pub mod progress_parser;
pub mod runner;
pub mod subtitles;

pub use compress::CompressionPlan;
pub use encoder::{EncoderProfile, EncoderSelector, FfmpegEncoderProbe, QualityPreference};
pub use extract::ExtractFormat;
pub use probe::{MediaInfo, StreamInfo, StreamKind};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::cleanup::TempPath;
use crate::config::{AppConfig, TargetDims};
use crate::jobs::JobContext;
use crate::progress::Stage;
use crate::{Error, Result};

use runner::{FfmpegInvocation, run_ffmpeg};

/// Audio codecs that can be stream-copied into an mp4 container.
const MP4_AUDIO_COPY: &[&str] = &["aac", "mp3"];
/// Codec a resolution change produces; matching sources may be remuxed.
const TARGET_VIDEO_CODEC: &str = "h264";

/// How a resolution change will be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPlan {
    /// Already at the target size and codec: copy streams into a new container.
    Remux,
    /// Scale into the box and pad the remainder with black.
    Rescale(TargetDims),
}

impl ResolutionPlan {
    pub fn decide(info: &MediaInfo, target: TargetDims) -> Self {
        match info.video_stream() {
            Some(v)
                if v.width == Some(target.width)
                    && v.height == Some(target.height)
                    && v.codec == TARGET_VIDEO_CODEC =>
            {
                Self::Remux
            }
            _ => Self::Rescale(target),
        }
    }
}

/// Scale to fit inside `dims`, preserving aspect ratio, and letterbox.
pub fn scale_pad_filter(dims: TargetDims) -> String {
    let TargetDims { width: w, height: h } = dims;
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black"
    )
}

/// Argument list under construction; always ends with the progress request.
struct FfmpegArgs(Vec<String>);

impl FfmpegArgs {
    fn new(input: &Path) -> Self {
        let mut args: Vec<String> = ["-hide_banner", "-y", "-loglevel", "warning", "-i"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(input.to_string_lossy().into_owned());
        Self(args)
    }

    fn push(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.0.extend(args.into_iter().map(Into::into));
        self
    }

    fn finish(mut self, output: &Path) -> Vec<String> {
        self.0.extend(
            ["-progress", "pipe:1", "-nostats"]
                .iter()
                .map(|s| s.to_string()),
        );
        self.0.push(output.to_string_lossy().into_owned());
        self.0
    }
}

fn audio_args(info: &MediaInfo, bitrate: &str) -> Vec<String> {
    let copyable = info
        .streams
        .iter()
        .find(|s| s.kind == StreamKind::Audio)
        .is_some_and(|a| MP4_AUDIO_COPY.contains(&a.codec.as_str()));
    if copyable {
        vec!["-c:a".into(), "copy".into()]
    } else {
        vec!["-c:a".into(), "aac".into(), "-b:a".into(), bitrate.into()]
    }
}

/// Copy the video as-is; audio mp4 cannot hold is re-encoded.
fn remux_args(video: &Path, info: &MediaInfo, output: &Path) -> Vec<String> {
    FfmpegArgs::new(video)
        .push(["-map", "0:v:0", "-map", "0:a?", "-c:v", "copy"])
        .push(audio_args(info, "192k"))
        .push(faststart())
        .finish(output)
}

fn faststart() -> [&'static str; 2] {
    ["-movflags", "+faststart"]
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

pub struct TranscodeEngine {
    ffmpeg: String,
    ffprobe: String,
    encoders: Arc<EncoderSelector>,
}

impl TranscodeEngine {
    pub fn new(
        ffmpeg: impl Into<String>,
        ffprobe: impl Into<String>,
        encoders: Arc<EncoderSelector>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            encoders,
        }
    }

    /// Engine with the default hardware-first cascade.
    pub fn from_config(config: &AppConfig) -> Self {
        let probe = Arc::new(FfmpegEncoderProbe::new(config.tools.ffmpeg.clone()));
        let cascade = EncoderProfile::cascade(&config.default_preset, config.default_crf);
        Self::new(
            config.tools.ffmpeg.clone(),
            config.tools.ffprobe.clone(),
            Arc::new(EncoderSelector::new(cascade, probe)),
        )
    }

    pub fn encoders(&self) -> &EncoderSelector {
        &self.encoders
    }

    async fn run(
        &self,
        ctx: &JobContext,
        stage: Stage,
        args: Vec<String>,
        cwd: Option<&Path>,
        duration_secs: f64,
    ) -> Result<()> {
        ctx.check_cancelled()?;
        let reporter = ctx.reporter(stage);
        run_ffmpeg(
            FfmpegInvocation {
                program: &self.ffmpeg,
                args,
                cwd,
                duration_secs,
            },
            &reporter,
            &ctx.cancel,
        )
        .await
    }

    pub async fn probe_media_info(&self, ctx: &JobContext, video: &Path) -> Result<MediaInfo> {
        probe::probe_media(&self.ffprobe, video, &ctx.cancel).await
    }

    pub async fn burn_subtitles(
        &self,
        ctx: &JobContext,
        video: &Path,
        subtitle: &Path,
    ) -> Result<TempPath> {
        let info = self.probe_media_info(ctx, video).await?;
        let encoder = self.encoders.resolve(ctx.preference.as_ref()).await;
        let subs = subtitles::normalize_subtitle(&self.ffmpeg, subtitle, &ctx.paths, &ctx.cancel)
            .await?;

        let prenormalized = if subtitles::needs_prenormalize(&info) {
            let out = TempPath::new(absolute(&ctx.paths.file("prenorm", ".mp4")));
            info!(job_id = %ctx.id, "Pre-normalising heavy source before burn-in");
            let args = FfmpegArgs::new(video)
                .push(["-vf".to_string(), subtitles::prenormalize_filter()])
                .push(encoder.fast_args())
                .push(["-c:a", "aac", "-b:a", "128k"])
                .finish(out.path());
            self.run(ctx, Stage::Preparing, args, None, info.duration_secs)
                .await?;
            Some(out)
        } else {
            None
        };
        let source = match &prenormalized {
            Some(out) => out.path().to_path_buf(),
            None => absolute(video),
        };

        let subs_name = subs
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Other("subtitle path has no file name".to_string()))?;
        let output = TempPath::new(absolute(&ctx.paths.file("subtitled", ".mp4")));
        let args = FfmpegArgs::new(&source)
            .push(["-vf".to_string(), subtitles::burn_filter(&subs_name)])
            .push(encoder.quality_args())
            .push(["-c:a", "aac", "-b:a", "192k"])
            .push(faststart())
            .finish(output.path());

        // The filter refers to the subtitle by bare name, so run next to it.
        let cwd = subs.path().parent().map(absolute);
        self.run(ctx, Stage::Processing, args, cwd.as_deref(), info.duration_secs)
            .await?;
        Ok(output)
    }

    pub async fn change_resolution(
        &self,
        ctx: &JobContext,
        video: &Path,
        target: TargetDims,
    ) -> Result<TempPath> {
        let info = self.probe_media_info(ctx, video).await?;
        let output = TempPath::new(ctx.paths.file(&target.to_string(), ".mp4"));

        let args = match ResolutionPlan::decide(&info, target) {
            ResolutionPlan::Remux => {
                info!(job_id = %ctx.id, %target, "Source already matches target, remuxing");
                remux_args(video, &info, output.path())
            }
            ResolutionPlan::Rescale(dims) => {
                let encoder = self.encoders.resolve(ctx.preference.as_ref()).await;
                FfmpegArgs::new(video)
                    .push(["-map", "0:v:0", "-map", "0:a?"])
                    .push(["-vf".to_string(), scale_pad_filter(dims)])
                    .push(encoder.quality_args())
                    .push(audio_args(&info, "192k"))
                    .push(faststart())
                    .finish(output.path())
            }
        };

        self.run(ctx, Stage::Processing, args, None, info.duration_secs)
            .await?;
        Ok(output)
    }

    pub async fn compress_to_size(
        &self,
        ctx: &JobContext,
        video: &Path,
        target_bytes: u64,
    ) -> Result<TempPath> {
        let info = self.probe_media_info(ctx, video).await?;
        self.compress_with_info(ctx, video, &info, target_bytes)
            .await
    }

    /// Compression with an already-probed source. The plan is computed before
    /// any encoder is probed or spawned.
    pub async fn compress_with_info(
        &self,
        ctx: &JobContext,
        video: &Path,
        info: &MediaInfo,
        target_bytes: u64,
    ) -> Result<TempPath> {
        let plan = CompressionPlan::compute(info.duration_secs, target_bytes)?;
        info!(
            job_id = %ctx.id,
            video_kbps = plan.video_kbps,
            target_bytes,
            "Compressing to target size"
        );

        let encoder = self.encoders.resolve(ctx.preference.as_ref()).await;
        let output = TempPath::new(ctx.paths.file("compressed", ".mp4"));
        let args = FfmpegArgs::new(video)
            .push(["-map", "0:v:0", "-map", "0:a:0?"])
            .push(encoder.bitrate_args(plan.video_kbps))
            .push([
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                format!("{}k", compress::AUDIO_BITRATE_KBPS),
            ])
            .push(faststart())
            .finish(output.path());

        self.run(ctx, Stage::Processing, args, None, info.duration_secs)
            .await?;
        Ok(output)
    }

    pub async fn extract_stream(
        &self,
        ctx: &JobContext,
        video: &Path,
        stream_index: u32,
        format: ExtractFormat,
    ) -> Result<TempPath> {
        let info = self.probe_media_info(ctx, video).await?;
        let stream = info
            .stream(stream_index)
            .ok_or_else(|| Error::unsupported(format!("no stream #{stream_index} in input")))?;
        if stream.kind != format.stream_kind() {
            return Err(Error::unsupported(format!(
                "cannot extract {} stream #{} as {}",
                stream.kind, stream_index, format
            )));
        }

        let output = TempPath::new(
            ctx.paths
                .file(&format!("stream{stream_index}"), format.extension()),
        );
        let args = FfmpegArgs::new(video)
            .push(["-map".to_string(), format!("0:{stream_index}")])
            .push(["-vn"])
            .push(format.codec_args())
            .finish(output.path());

        self.run(ctx, Stage::Processing, args, None, info.duration_secs)
            .await?;
        Ok(output)
    }
}
