//! Source acquisition: turn a [`Source`] into a local file.
//!
//! Whatever the strategy, the result is an [`AcquiredFile`] that owns its
//! temp path; a failed acquisition never leaves a partial file behind.

pub mod http;
pub mod torrent;
pub mod ytdlp;

pub use http::{AcquisitionPlan, HttpDownloader, ProbeResult, Strategy};
pub use torrent::{Aria2Engine, TorrentEngine, TorrentHandle, TorrentState, TorrentStatus};
pub use ytdlp::{FormatListing, FormatOption, MediaExtractor, YtDlp};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::cleanup::{TempPath, file_size};
use crate::config::{AppConfig, extension_for_content_type, is_video_extension};
use crate::jobs::JobContext;
use crate::progress::{ProgressReporter, Stage};
use crate::session::Source;
use crate::utils::filename::extension_of;
use crate::{Error, Result};

/// Extension used when neither the name nor the content type tells.
const FALLBACK_EXTENSION: &str = ".mkv";

/// Transport-side access to uploaded files.
#[async_trait]
pub trait UploadFetcher: Send + Sync {
    /// Copy the upload identified by `file_ref` to `dest`.
    async fn fetch(
        &self,
        file_ref: &str,
        dest: &Path,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// A local copy of a source. Dropping it deletes the file (or torrent tree).
#[derive(Debug)]
pub struct AcquiredFile {
    _guard: TempPath,
    path: PathBuf,
    size: u64,
    original_name: String,
}

impl AcquiredFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Name shown to the user and used for the artifact's suggested name.
    pub fn original_name(&self) -> &str {
        &self.original_name
    }
}

#[derive(Debug, Clone)]
pub struct AcquireRequest<'a> {
    pub source: &'a Source,
    limit: Option<u64>,
    format: Option<String>,
    title: Option<String>,
}

impl<'a> AcquireRequest<'a> {
    pub fn new(source: &'a Source) -> Self {
        Self {
            source,
            limit: None,
            format: None,
            title: None,
        }
    }

    /// Tighter cap than the configured one.
    pub fn with_size_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Extractor selector for stream-manifest sources.
    pub fn with_format(mut self, selector: impl Into<String>) -> Self {
        self.format = Some(selector.into());
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }
}

pub struct Acquirer {
    http: HttpDownloader,
    extractor: Arc<dyn MediaExtractor>,
    torrents: Arc<dyn TorrentEngine>,
    uploads: Arc<dyn UploadFetcher>,
    max_download_bytes: u64,
    max_upload_bytes: u64,
    torrent_poll_interval: Duration,
}

impl Acquirer {
    pub fn new(
        http: HttpDownloader,
        extractor: Arc<dyn MediaExtractor>,
        torrents: Arc<dyn TorrentEngine>,
        uploads: Arc<dyn UploadFetcher>,
    ) -> Self {
        let defaults = AppConfig::default();
        Self {
            http,
            extractor,
            torrents,
            uploads,
            max_download_bytes: defaults.max_download_bytes,
            max_upload_bytes: defaults.max_upload_bytes,
            torrent_poll_interval: defaults.torrent_poll_interval,
        }
    }

    /// Acquirer backed by yt-dlp and aria2c.
    pub fn from_config(
        config: &AppConfig,
        client: reqwest::Client,
        uploads: Arc<dyn UploadFetcher>,
    ) -> Self {
        let http = HttpDownloader::new(client.clone(), config.parallel_chunks, config.min_parallel_bytes);
        let extractor = Arc::new(YtDlp::new(config.tools.ytdlp.clone()));
        let torrents = Arc::new(Aria2Engine::new(config.tools.aria2c.clone(), client));
        Self::new(http, extractor, torrents, uploads).with_limits(config)
    }

    pub fn with_limits(mut self, config: &AppConfig) -> Self {
        self.max_download_bytes = config.max_download_bytes;
        self.max_upload_bytes = config.max_upload_bytes;
        self.torrent_poll_interval = config.torrent_poll_interval;
        self
    }

    pub fn http(&self) -> &HttpDownloader {
        &self.http
    }

    pub fn extractor(&self) -> &dyn MediaExtractor {
        self.extractor.as_ref()
    }

    pub fn uploads(&self) -> &dyn UploadFetcher {
        self.uploads.as_ref()
    }

    fn limit_for(&self, request: &AcquireRequest<'_>) -> u64 {
        let base = match request.source {
            Source::Upload { .. } => self.max_upload_bytes,
            _ => self.max_download_bytes,
        };
        request.limit.map_or(base, |l| l.min(base))
    }

    /// Fetch the source into `{jobId}_input{ext}` (or `{jobId}_torrent/`).
    pub async fn acquire(&self, request: AcquireRequest<'_>, ctx: &JobContext) -> Result<AcquiredFile> {
        ctx.check_cancelled()?;
        let limit = self.limit_for(&request);

        let (guard, path, original_name) = match request.source {
            Source::Upload { file_ref, name, size } => {
                if *size > limit {
                    return Err(Error::TooLarge { limit, actual: *size });
                }
                let ext = match extension_of(name) {
                    ext if ext.is_empty() => FALLBACK_EXTENSION.to_string(),
                    ext => ext,
                };
                let guard = TempPath::new(ctx.paths.file("input", &ext));
                let reporter = ctx.reporter(Stage::Uploading);
                self.uploads
                    .fetch(file_ref, guard.path(), &reporter, &ctx.cancel)
                    .await?;
                reporter.complete("");
                let path = guard.path().to_path_buf();
                (guard, path, name.clone())
            }
            Source::Url { address } => {
                let probe = self.http.probe(address).await?;
                let (name, ext) = infer_name(address, &probe);
                debug!(total = probe.total, %name, "Probed direct link");
                let guard = TempPath::new(ctx.paths.file("input", &ext));
                let reporter = ctx.reporter(Stage::Downloading);
                self.http
                    .download(address, &probe, guard.path(), limit, &reporter, &ctx.cancel)
                    .await?;
                let path = guard.path().to_path_buf();
                (guard, path, name)
            }
            Source::StreamManifest { address } => {
                let selector = request.format.as_deref().unwrap_or(ytdlp::BEST_SELECTOR);
                let reporter = ctx.reporter(Stage::Downloading);
                let path = self
                    .extractor
                    .download(address, selector, &ctx.paths, limit, &reporter, &ctx.cancel)
                    .await?;
                let guard = TempPath::new(&path);
                let ext = extension_of(&path.to_string_lossy());
                let title = request
                    .title
                    .clone()
                    .unwrap_or_else(|| request.source.display_name());
                (guard, path, format!("{title}{ext}"))
            }
            Source::Magnet { address } => {
                let reporter = ctx.reporter(Stage::Downloading);
                let (dir, payload) = torrent::fetch_torrent(
                    self.torrents.as_ref(),
                    address,
                    &ctx.paths,
                    limit,
                    self.torrent_poll_interval,
                    &reporter,
                    &ctx.cancel,
                )
                .await?;
                let name = payload
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| request.source.display_name());
                (dir, payload, name)
            }
        };

        let size = file_size(&path).await?;
        if size > limit {
            return Err(Error::TooLarge { limit, actual: size });
        }
        info!(
            job_id = %ctx.id,
            source = request.source.kind_label(),
            size,
            "Acquired source"
        );
        Ok(AcquiredFile {
            _guard: guard,
            path,
            size,
            original_name,
        })
    }
}

/// Display name and container extension for a direct link.
///
/// The name comes from `Content-Disposition` or the last path segment; the
/// extension from that name when it is a known video type, else from the
/// content type, else `.mkv`.
pub fn infer_name(address: &str, probe: &ProbeResult) -> (String, String) {
    let name = probe
        .file_name
        .clone()
        .or_else(|| {
            Url::parse(address).ok().and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(str::to_string))
                    .filter(|s| !s.is_empty())
            })
        })
        .unwrap_or_else(|| "video".to_string());

    let ext = extension_of(&name);
    let ext = if is_video_extension(&ext) {
        ext
    } else {
        probe
            .content_type
            .as_deref()
            .and_then(extension_for_content_type)
            .unwrap_or(FALLBACK_EXTENSION)
            .to_string()
    };
    (name, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(content_type: Option<&str>, file_name: Option<&str>) -> ProbeResult {
        ProbeResult {
            total: 10,
            accepts_ranges: true,
            content_type: content_type.map(str::to_string),
            file_name: file_name.map(str::to_string),
        }
    }

    #[test]
    fn test_infer_name_from_path() {
        let (name, ext) = infer_name("https://cdn.example.com/v/Movie.MP4?sig=1", &probe(None, None));
        assert_eq!(name, "Movie.MP4");
        assert_eq!(ext, ".mp4");
    }

    #[test]
    fn test_infer_name_from_content_type() {
        let (name, ext) = infer_name(
            "https://cdn.example.com/download?id=7",
            &probe(Some("video/webm; charset=binary"), None),
        );
        assert_eq!(name, "download");
        assert_eq!(ext, ".webm");
    }

    #[test]
    fn test_infer_name_prefers_disposition_and_defaults() {
        let (name, ext) = infer_name("https://x.test/a", &probe(None, Some("clip.mov")));
        assert_eq!(name, "clip.mov");
        assert_eq!(ext, ".mov");

        let (name, ext) = infer_name("https://x.test/", &probe(Some("application/octet-stream"), None));
        assert_eq!(name, "video");
        assert_eq!(ext, ".mkv");
    }
}
