//! Engine behaviour that does not need a working ffmpeg.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use vidforge::Error;
use vidforge::cleanup::JobPaths;
use vidforge::jobs::{JobContext, JobId};
use vidforge::progress::ProgressReporter;
use vidforge::transcode::encoder::EncoderProbe;
use vidforge::transcode::runner::wait_or_kill;
use vidforge::transcode::{EncoderProfile, EncoderSelector, MediaInfo, TranscodeEngine};

struct CountingProbe(std::sync::atomic::AtomicUsize);

#[async_trait]
impl EncoderProbe for CountingProbe {
    async fn is_usable(&self, _profile: &EncoderProfile) -> bool {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        false
    }
}

fn context(root: &std::path::Path) -> JobContext {
    let id = JobId::generate();
    JobContext::new(
        id.clone(),
        JobPaths::new(root, id.as_str()),
        ProgressReporter::noop(),
        CancellationToken::new(),
    )
}

const ONE_HOUR: &str = r#"{
    "streams": [{"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720}],
    "format": {"format_name": "mov,mp4", "duration": "3600.0"}
}"#;

#[tokio::test]
async fn compress_rejects_tiny_target_before_probing_encoders() {
    let probe = Arc::new(CountingProbe(Default::default()));
    let selector = EncoderSelector::new(
        EncoderProfile::cascade("fast", 23),
        probe.clone(),
    );
    let engine = TranscodeEngine::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe", Arc::new(selector));
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path());
    let info = MediaInfo::from_json(ONE_HOUR).unwrap();

    let err = engine
        .compress_with_info(&ctx, &dir.path().join("in.mp4"), &info, 1024 * 1024)
        .await
        .unwrap_err();

    match err {
        Error::TargetTooSmall { minimum_bytes } => assert!(minimum_bytes > 90 * 1024 * 1024),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(probe.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(engine.encoders().cached().is_none());
}

#[tokio::test]
async fn missing_ffprobe_is_tool_unavailable() {
    let engine = TranscodeEngine::new(
        "/nonexistent/ffmpeg",
        "/nonexistent/ffprobe",
        Arc::new(EncoderSelector::new(
            EncoderProfile::cascade("fast", 23),
            Arc::new(CountingProbe(Default::default())),
        )),
    );
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path());

    let err = engine
        .probe_media_info(&ctx, &dir.path().join("in.mp4"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ToolUnavailable(_)), "{err}");
}

#[cfg(unix)]
#[tokio::test]
async fn cancellation_kills_child_process() {
    let mut child = process_utils::tokio_command("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), wait_or_kill(&mut child, &cancel))
        .await
        .expect("cancellation should stop the wait promptly");
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(child.try_wait().unwrap().is_some());
}
