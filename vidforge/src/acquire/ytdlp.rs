//! Stream-manifest sources through the external extraction tool (yt-dlp).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{JobPaths, cleanup};
use crate::progress::ProgressReporter;
use crate::transcode::runner::{DIAGNOSTIC_TAIL_CHARS, collect_tail, run_capture, spawn_error, wait_or_kill};
use crate::utils::format::{format_eta, format_rate, tail_chars};
use crate::{Error, Result};

/// Marks our own progress lines on stdout.
const PROGRESS_PREFIX: &str = "[vidforge]";
/// Selector for the "Best quality" entry.
pub const BEST_SELECTOR: &str = "bestvideo+bestaudio/best";
/// Role of the extractor's output file.
const OUTPUT_ROLE: &str = "ytdlp";

/// One entry of the quality menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOption {
    pub label: String,
    pub selector: String,
    pub height: Option<u32>,
    pub estimated_size: Option<u64>,
}

impl FormatOption {
    pub fn best() -> Self {
        Self {
            label: "Best quality".to_string(),
            selector: BEST_SELECTOR.to_string(),
            height: None,
            estimated_size: None,
        }
    }

    pub fn for_height(height: u32, estimated_size: Option<u64>) -> Self {
        Self {
            label: format!("{height}p"),
            selector: format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]"),
            height: Some(height),
            estimated_size,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FormatListing {
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    /// "Best quality" first, then one entry per height, tallest first.
    pub formats: Vec<FormatOption>,
}

/// External extraction tool.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// List the available qualities without downloading.
    async fn list_formats(&self, url: &str, cancel: &CancellationToken) -> Result<FormatListing>;

    /// Download with `selector` into the job's temp files, returning the path.
    async fn download(
        &self,
        url: &str,
        selector: &str,
        paths: &JobPaths,
        limit: u64,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    duration: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
    #[serde(default)]
    formats: Vec<FormatJson>,
}

#[derive(Debug, Deserialize)]
struct FormatJson {
    height: Option<u32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

impl FormatJson {
    fn size(&self) -> Option<u64> {
        self.filesize
            .or(self.filesize_approx)
            .filter(|s| *s > 0.0)
            .map(|s| s as u64)
    }

    fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|c| c != "none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|c| c != "none")
    }
}

/// Parse `yt-dlp -J` output into the quality menu.
pub fn parse_listing(json: &str) -> Result<FormatListing> {
    let info: InfoJson = serde_json::from_str(json)?;

    let audio_size = info
        .formats
        .iter()
        .filter(|f| f.has_audio() && !f.has_video())
        .filter_map(FormatJson::size)
        .max();

    let mut heights: Vec<(u32, Option<u64>)> = Vec::new();
    for format in info.formats.iter().filter(|f| f.has_video()) {
        let Some(height) = format.height.filter(|h| *h > 0) else {
            continue;
        };
        let size = format.size();
        match heights.iter_mut().find(|(h, _)| *h == height) {
            Some((_, best)) => *best = (*best).max(size),
            None => heights.push((height, size)),
        }
    }
    heights.sort_by(|a, b| b.0.cmp(&a.0));

    let mut best = FormatOption::best();
    best.estimated_size = info
        .filesize
        .or(info.filesize_approx)
        .map(|s| s as u64)
        .or_else(|| heights.first().and_then(|(_, s)| *s).map(|v| v + audio_size.unwrap_or(0)));

    let mut formats = vec![best];
    formats.extend(heights.into_iter().map(|(height, size)| {
        let estimate = size.map(|v| v + audio_size.unwrap_or(0));
        FormatOption::for_height(height, estimate)
    }));

    Ok(FormatListing {
        title: info.title,
        duration_secs: info.duration,
        formats,
    })
}

/// One parsed progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractorProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<f64>,
}

impl ExtractorProgress {
    pub fn percent(&self) -> u8 {
        match self.total {
            Some(total) if total > 0 => (self.downloaded.saturating_mul(100) / total).min(100) as u8,
            _ => 0,
        }
    }
}

fn field(value: Option<&str>) -> Option<f64> {
    value
        .filter(|v| *v != "NA" && *v != "None")
        .and_then(|v| v.parse::<f64>().ok())
}

/// Parse a line printed through our `--progress-template`.
pub fn parse_progress_line(line: &str) -> Option<ExtractorProgress> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut parts = rest.split_whitespace();
    let downloaded = field(parts.next())? as u64;
    let total = field(parts.next());
    let estimate = field(parts.next());
    Some(ExtractorProgress {
        downloaded,
        total: total.or(estimate).map(|t| t as u64),
        speed: field(parts.next()),
        eta: field(parts.next()),
    })
}

/// yt-dlp invoked as a subprocess.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
}

impl YtDlp {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn download_args(&self, url: &str, selector: &str, paths: &JobPaths, limit: u64) -> Vec<String> {
        let template = paths.file(OUTPUT_ROLE, ".%(ext)s");
        let progress = format!(
            "download:{PROGRESS_PREFIX} %(progress.downloaded_bytes)s %(progress.total_bytes)s \
             %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s"
        );
        vec![
            "--no-playlist".to_string(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            progress,
            "-f".to_string(),
            selector.to_string(),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "--concurrent-fragments".to_string(),
            "16".to_string(),
            "--max-filesize".to_string(),
            limit.to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            url.to_string(),
        ]
    }
}

#[async_trait]
impl MediaExtractor for YtDlp {
    async fn list_formats(&self, url: &str, cancel: &CancellationToken) -> Result<FormatListing> {
        let mut command = process_utils::tokio_command(&self.program);
        command.args(["-J", "--skip-download", "--no-playlist", "--no-warnings", url]);
        let output = run_capture(command, cancel).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::unreachable(tail_chars(stderr.trim(), DIAGNOSTIC_TAIL_CHARS)));
        }
        let listing = parse_listing(&String::from_utf8_lossy(&output.stdout))?;
        debug!(url, formats = listing.formats.len(), "Listed formats");
        Ok(listing)
    }

    async fn download(
        &self,
        url: &str,
        selector: &str,
        paths: &JobPaths,
        limit: u64,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let result = self
            .run_download(url, selector, paths, limit, reporter, cancel)
            .await;
        if result.is_err() {
            remove_outputs(paths).await;
        }
        result
    }
}

impl YtDlp {
    async fn run_download(
        &self,
        url: &str,
        selector: &str,
        paths: &JobPaths,
        limit: u64,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let mut command = process_utils::tokio_command(&self.program);
        command
            .args(self.download_args(url, selector, paths, limit))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        info!(url, selector, "Starting extractor download");

        let mut child = command.spawn().map_err(|e| spawn_error(&self.program, e))?;
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| collect_tail(stderr, DIAGNOSTIC_TAIL_CHARS));

        let mut printed_path = None;
        let mut largest_seen = 0u64;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return Err(Error::Cancelled);
                    }
                    line = lines.next_line() => line,
                };
                let Ok(Some(line)) = line else { break };
                if let Some(progress) = parse_progress_line(&line) {
                    // Fragmented streams ignore --max-filesize.
                    let seen = progress.downloaded.max(progress.total.unwrap_or(0));
                    largest_seen = largest_seen.max(seen);
                    if seen > limit {
                        let _ = child.kill().await;
                        warn!(url, limit, actual = seen, "Extractor download over the size limit");
                        return Err(Error::TooLarge { limit, actual: seen });
                    }
                    reporter.report(
                        progress.percent(),
                        progress.speed.map(format_rate).unwrap_or_default(),
                        format_eta(progress.eta.unwrap_or(0.0)),
                    );
                } else if !line.trim().is_empty() {
                    printed_path = Some(PathBuf::from(line.trim()));
                }
            }
        }

        let status = wait_or_kill(&mut child, cancel).await?;
        let diagnostic = match stderr_tail {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(Error::ProcessFailed {
                code: status.code(),
                diagnostic,
            });
        }

        let path = match printed_path.filter(|p| p.is_file()) {
            Some(path) => path,
            // yt-dlp exits cleanly when --max-filesize skips the download.
            None => find_output(paths).await.ok_or(Error::TooLarge {
                limit,
                actual: largest_seen,
            })?,
        };
        reporter.complete("");
        Ok(path)
    }
}

/// Remove every `{jobId}_ytdlp.*` file, finished or partial.
async fn remove_outputs(paths: &JobPaths) {
    let prefix = paths.file_name(OUTPUT_ROLE, ".");
    let Ok(mut entries) = tokio::fs::read_dir(paths.root()).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            cleanup(Some(entry.path().as_path()));
        }
    }
}

/// Largest finished `{jobId}_ytdlp.*` file in the temp root.
async fn find_output(paths: &JobPaths) -> Option<PathBuf> {
    let prefix = paths.file_name(OUTPUT_ROLE, ".");
    let mut entries = tokio::fs::read_dir(paths.root()).await.ok()?;
    let mut best: Option<(u64, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || is_partial(&name) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if meta.is_file() && best.as_ref().is_none_or(|(size, _)| meta.len() > *size) {
            best = Some((meta.len(), entry.path()));
        }
    }
    best.map(|(_, path)| path)
}

fn is_partial(name: &str) -> bool {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    matches!(ext, "part" | "ytdl" | "temp")
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &str = r#"{
        "title": "Sample",
        "duration": 212.0,
        "formats": [
            {"format_id": "140", "vcodec": "none", "acodec": "mp4a.40.2", "filesize": 3400000},
            {"format_id": "134", "height": 360, "vcodec": "avc1", "acodec": "none", "filesize": 5000000},
            {"format_id": "243", "height": 360, "vcodec": "vp9", "acodec": "none", "filesize_approx": 6000000.0},
            {"format_id": "137", "height": 1080, "vcodec": "avc1", "acodec": "none", "filesize": null},
            {"format_id": "136", "height": 720, "vcodec": "avc1", "acodec": "none", "filesize": 20000000},
            {"format_id": "sb0", "height": 90, "vcodec": "none", "acodec": "none"}
        ]
    }"#;

    #[test]
    fn test_listing_dedupes_and_sorts() {
        let listing = parse_listing(INFO).unwrap();
        assert_eq!(listing.title.as_deref(), Some("Sample"));
        let labels: Vec<_> = listing.formats.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["Best quality", "1080p", "720p", "360p"]);

        assert_eq!(listing.formats[0].selector, BEST_SELECTOR);
        assert_eq!(
            listing.formats[2].selector,
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
        assert_eq!(listing.formats[3].estimated_size, Some(9_400_000));
        assert_eq!(listing.formats[1].estimated_size, None);
    }

    #[test]
    fn test_listing_without_formats() {
        let listing = parse_listing(r#"{"title": "x"}"#).unwrap();
        assert_eq!(listing.formats, vec![FormatOption::best()]);
    }

    #[test]
    fn test_parse_progress_line() {
        let p = parse_progress_line("[vidforge] 1048576 4194304 NA 524288.5 6").unwrap();
        assert_eq!(p.downloaded, 1_048_576);
        assert_eq!(p.total, Some(4_194_304));
        assert_eq!(p.percent(), 25);
        assert_eq!(p.eta, Some(6.0));

        let estimated = parse_progress_line("[vidforge] 100 NA 400.0 NA NA").unwrap();
        assert_eq!(estimated.total, Some(400));
        assert_eq!(estimated.speed, None);

        assert!(parse_progress_line("/tmp/vf/ab_ytdlp.mp4").is_none());
        assert!(parse_progress_line("[vidforge] NA NA NA NA NA").is_none());
    }

    #[test]
    fn test_download_args() {
        let paths = JobPaths::new("/tmp/vf", "ab12");
        let args = YtDlp::new("yt-dlp").download_args("https://youtu.be/x", BEST_SELECTOR, &paths, 100);
        let joined = args.join(" ");
        assert!(joined.contains("-o /tmp/vf/ab12_ytdlp.%(ext)s"));
        assert!(joined.contains("--merge-output-format mp4"));
        assert!(joined.contains("--concurrent-fragments 16"));
        assert!(joined.contains("--print after_move:filepath"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/x"));
    }

    #[tokio::test]
    async fn test_find_output_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        let paths = JobPaths::new(dir.path(), "ab12");
        std::fs::write(dir.path().join("ab12_ytdlp.mp4"), b"video").unwrap();
        std::fs::write(dir.path().join("ab12_ytdlp.f137.mp4.part"), vec![0u8; 64]).unwrap();
        std::fs::write(dir.path().join("cd34_ytdlp.mp4"), vec![0u8; 64]).unwrap();

        let found = find_output(&paths).await.unwrap();
        assert_eq!(found, dir.path().join("ab12_ytdlp.mp4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_over_limit_stops_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let tool = crate::utils::testing::fake_tool(
            dir.path(),
            "yt-dlp",
            "echo '[vidforge] 512 NA 4096.0 1000.0 3'\necho '[vidforge] 2048 NA 4096.0 1000.0 2'\nsleep 30",
        );
        let paths = JobPaths::new(dir.path(), "ab12");

        let started = std::time::Instant::now();
        let err = YtDlp::new(tool.to_string_lossy())
            .download(
                "https://youtu.be/x",
                BEST_SELECTOR,
                &paths,
                1024,
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooLarge { limit: 1024, actual: 4096 }), "{err}");
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_skipped_download_is_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let tool = crate::utils::testing::fake_tool(dir.path(), "yt-dlp", "exit 0");
        let paths = JobPaths::new(dir.path(), "cd34");

        let err = YtDlp::new(tool.to_string_lossy())
            .download(
                "https://youtu.be/x",
                BEST_SELECTOR,
                &paths,
                1024,
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooLarge { limit: 1024, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = YtDlp::new("no-such-ytdlp-31")
            .list_formats("https://youtu.be/x", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolUnavailable(_)));
    }
}
