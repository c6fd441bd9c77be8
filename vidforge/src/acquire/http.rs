//! Direct-link downloads: probe, then parallel byte ranges or a single stream.
//!
//! The destination is pre-allocated and every range writes straight into its
//! offset through its own file handle. If any range comes back as a plain 200
//! (server ignored `Range`) or is otherwise rejected, the whole parallel
//! attempt is dropped and the file is fetched again as one stream. That
//! fallback happens at most once per download.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::{StreamExt, TryStreamExt, stream};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, RANGE};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MAX_PARALLEL_CHUNKS;
use crate::progress::ProgressReporter;
use crate::utils::format::{format_eta, format_rate, format_size};
use crate::{Error, Result};

/// What a preliminary request revealed about a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeResult {
    /// Total size in bytes, 0 when unknown.
    pub total: u64,
    /// False only when the server said so (`Accept-Ranges: none` or a 200 to
    /// the ranged probe).
    pub accepts_ranges: bool,
    pub content_type: Option<String>,
    /// `filename=` from `Content-Disposition`.
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ParallelRanged,
    SingleStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionPlan {
    pub total: u64,
    pub strategy: Strategy,
    pub chunk_count: usize,
    pub chunk_size: u64,
}

impl AcquisitionPlan {
    /// Parallel only for a known size of at least `min_parallel_bytes` on a
    /// server that has not refused ranges.
    pub fn decide(probe: &ProbeResult, chunks: usize, min_parallel_bytes: u64) -> Self {
        let chunks = chunks.clamp(1, MAX_PARALLEL_CHUNKS);
        let total = probe.total;
        let parallel = total > 0
            && total >= min_parallel_bytes
            && probe.accepts_ranges
            && chunks > 1;

        if !parallel {
            return Self {
                total,
                strategy: Strategy::SingleStream,
                chunk_count: 1,
                chunk_size: total,
            };
        }

        let chunk_size = total.div_ceil(chunks as u64);
        Self {
            total,
            strategy: Strategy::ParallelRanged,
            chunk_count: total.div_ceil(chunk_size) as usize,
            chunk_size,
        }
    }

    /// Inclusive byte ranges covering `[0, total)`.
    pub fn ranges(&self) -> Vec<(u64, u64)> {
        if self.total == 0 || self.chunk_size == 0 {
            return Vec::new();
        }
        (0..self.total)
            .step_by(self.chunk_size as usize)
            .map(|start| (start, (start + self.chunk_size).min(self.total) - 1))
            .collect()
    }
}

/// Why a parallel attempt stopped.
#[derive(Debug)]
enum RangeError {
    /// Server answered 200 to a ranged request.
    Ignored,
    /// Bad status, short body or transport error on one range.
    Rejected(String),
    /// Not recoverable by a single-stream retry.
    Fatal(Error),
}

impl From<Error> for RangeError {
    fn from(err: Error) -> Self {
        Self::Fatal(err)
    }
}

/// Byte counter shared by all ranges of one download.
pub struct TransferTracker {
    downloaded: AtomicU64,
    total: u64,
    started: Instant,
    reporter: ProgressReporter,
}

impl TransferTracker {
    pub fn new(total: u64, reporter: ProgressReporter) -> Self {
        Self {
            downloaded: AtomicU64::new(0),
            total,
            started: Instant::now(),
            reporter,
        }
    }

    /// Count `bytes` and report. Returns the new running total.
    pub fn add(&self, bytes: u64) -> u64 {
        let downloaded = self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            downloaded as f64 / elapsed
        } else {
            0.0
        };

        if self.total > 0 {
            let percent = (downloaded.saturating_mul(100) / self.total).min(100) as u8;
            let eta = if rate > 0.0 {
                self.total.saturating_sub(downloaded) as f64 / rate
            } else {
                0.0
            };
            self.reporter.report(percent, format_rate(rate), format_eta(eta));
        } else {
            self.reporter.report_event(
                crate::progress::ProgressEvent::new(self.reporter.stage(), 0, format_rate(rate), "-")
                    .with_detail(format_size(downloaded)),
            );
        }
        downloaded
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.downloaded.store(0, Ordering::Relaxed);
    }

    pub fn average_rate(&self) -> String {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            format_rate(self.downloaded() as f64 / elapsed)
        } else {
            String::new()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    chunks: usize,
    min_parallel_bytes: u64,
}

impl HttpDownloader {
    pub fn new(client: reqwest::Client, chunks: usize, min_parallel_bytes: u64) -> Self {
        Self {
            client,
            chunks: chunks.clamp(1, MAX_PARALLEL_CHUNKS),
            min_parallel_bytes,
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// HEAD, then a one-byte ranged GET if HEAD was rejected or gave no size.
    pub async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let mut result = ProbeResult {
            accepts_ranges: true,
            ..Default::default()
        };

        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let headers = resp.headers();
                result.total = header_u64(headers, CONTENT_LENGTH).unwrap_or(0);
                result.accepts_ranges = header_str(headers, ACCEPT_RANGES)
                    .is_none_or(|v| !v.eq_ignore_ascii_case("none"));
                result.content_type = header_str(headers, CONTENT_TYPE).map(str::to_string);
                result.file_name = header_str(headers, CONTENT_DISPOSITION).and_then(disposition_filename);
            }
            Ok(resp) => debug!(status = %resp.status(), "HEAD rejected, trying ranged GET"),
            Err(e) => debug!(error = %e, "HEAD failed, trying ranged GET"),
        }

        if result.total > 0 {
            return Ok(result);
        }

        let resp = self.client.get(url).header(RANGE, "bytes=0-0").send().await?;
        let status = resp.status();
        let headers = resp.headers();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                result.total = header_str(headers, CONTENT_RANGE)
                    .and_then(content_range_total)
                    .unwrap_or(0);
            }
            s if s.is_success() => {
                result.total = header_u64(headers, CONTENT_LENGTH).unwrap_or(0);
                result.accepts_ranges = false;
            }
            s => return Err(Error::unreachable(format!("HTTP {s}"))),
        }
        if result.content_type.is_none() {
            result.content_type = header_str(headers, CONTENT_TYPE).map(str::to_string);
        }
        if result.file_name.is_none() {
            result.file_name = header_str(headers, CONTENT_DISPOSITION).and_then(disposition_filename);
        }
        Ok(result)
    }

    pub fn plan(&self, probe: &ProbeResult) -> AcquisitionPlan {
        AcquisitionPlan::decide(probe, self.chunks, self.min_parallel_bytes)
    }

    /// Download `url` into `dest` and return the final size.
    ///
    /// `dest` is left in whatever state the failure produced; callers hold it
    /// in a `TempPath`.
    pub async fn download(
        &self,
        url: &str,
        probe: &ProbeResult,
        dest: &Path,
        limit: u64,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if probe.total > limit {
            return Err(Error::TooLarge {
                limit,
                actual: probe.total,
            });
        }

        let plan = self.plan(probe);
        let tracker = TransferTracker::new(plan.total, reporter.clone());
        debug!(?plan, "Acquisition plan");

        if plan.strategy == Strategy::ParallelRanged {
            match self.fetch_parallel(url, &plan, dest, limit, &tracker, cancel).await {
                Ok(()) => {
                    reporter.complete(tracker.average_rate());
                    return Ok(plan.total);
                }
                Err(RangeError::Fatal(e)) => return Err(e),
                Err(RangeError::Ignored) => {
                    info!(url, "Server ignored Range, restarting as single stream");
                }
                Err(RangeError::Rejected(reason)) => {
                    info!(url, %reason, "Range rejected, restarting as single stream");
                }
            }
            tracker.reset();
        }

        let size = self.fetch_single(url, dest, limit, &tracker, cancel).await?;
        reporter.complete(tracker.average_rate());
        Ok(size)
    }

    async fn fetch_parallel(
        &self,
        url: &str,
        plan: &AcquisitionPlan,
        dest: &Path,
        limit: u64,
        tracker: &TransferTracker,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), RangeError> {
        let file = File::create(dest)
            .await
            .map_err(|e| Error::io_path("creating", dest, e))?;
        file.set_len(plan.total)
            .await
            .map_err(|e| Error::io_path("pre-allocating", dest, e))?;
        drop(file);

        // Dropping the stream on the first error drops every in-flight range.
        stream::iter(plan.ranges())
            .map(|(start, end)| self.fetch_range(url, start, end, dest, limit, tracker, cancel))
            .buffer_unordered(plan.chunk_count)
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        dest: &Path,
        limit: u64,
        tracker: &TransferTracker,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), RangeError> {
        let request = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={start}-{end}"))
            .send();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(RangeError::Fatal(Error::Cancelled)),
            resp = request => resp.map_err(|e| RangeError::Rejected(e.to_string()))?,
        };
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => return Err(RangeError::Ignored),
            s => return Err(RangeError::Rejected(format!("HTTP {s} for bytes {start}-{end}"))),
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(dest)
            .await
            .map_err(|e| Error::io_path("opening", dest, e))?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| Error::io_path("seeking in", dest, e))?;

        let expected = end - start + 1;
        let mut written = 0u64;
        let mut body = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(RangeError::Fatal(Error::Cancelled)),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk.map_err(|e| RangeError::Rejected(e.to_string()))?;
            let len = bytes.len() as u64;
            if written + len > expected {
                return Err(RangeError::Rejected(format!(
                    "range {start}-{end} returned more than {expected} bytes"
                )));
            }
            file.write_all(&bytes)
                .await
                .map_err(|e| Error::io_path("writing", dest, e))?;
            written += len;

            let total = tracker.add(len);
            if total > limit {
                return Err(RangeError::Fatal(Error::TooLarge { limit, actual: total }));
            }
        }
        file.flush()
            .await
            .map_err(|e| Error::io_path("flushing", dest, e))?;

        if written != expected {
            return Err(RangeError::Rejected(format!(
                "range {start}-{end} ended after {written} of {expected} bytes"
            )));
        }
        Ok(())
    }

    async fn fetch_single(
        &self,
        url: &str,
        dest: &Path,
        limit: u64,
        tracker: &TransferTracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            resp = self.client.get(url).send() => resp?,
        };
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::unreachable(format!("HTTP {status}")));
        }
        if let Some(len) = header_u64(resp.headers(), CONTENT_LENGTH)
            && len > limit
        {
            return Err(Error::TooLarge { limit, actual: len });
        }

        let file = File::create(dest)
            .await
            .map_err(|e| Error::io_path("creating", dest, e))?;
        let mut writer = BufWriter::new(file);
        let mut body = resp.bytes_stream();
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            writer
                .write_all(&bytes)
                .await
                .map_err(|e| Error::io_path("writing", dest, e))?;
            written += bytes.len() as u64;

            let total = tracker.add(bytes.len() as u64);
            if total > limit {
                return Err(Error::TooLarge { limit, actual: total });
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| Error::io_path("flushing", dest, e))?;

        if written == 0 {
            warn!(url, "Download finished with an empty body");
        }
        Ok(written)
    }

    /// Small in-memory fetch with a hard cap (subtitle links).
    pub async fn fetch_small(&self, url: &str, limit: u64, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            resp = self.client.get(url).send() => resp?,
        };
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::unreachable(format!("HTTP {status}")));
        }

        let mut body = resp.bytes_stream();
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
            if data.len() as u64 > limit {
                return Err(Error::TooLarge {
                    limit,
                    actual: data.len() as u64,
                });
            }
        }
        Ok(data)
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.trim().parse().ok())
}

/// Total from `bytes 0-0/12345`; `*` yields `None`.
pub fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next().and_then(|v| v.trim().parse().ok())
}

/// `filename` from a `Content-Disposition` header value.
pub fn disposition_filename(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(total: u64) -> ProbeResult {
        ProbeResult {
            total,
            accepts_ranges: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_parallel() {
        let plan = AcquisitionPlan::decide(&probe(100 * 1024 * 1024), 8, 4 * 1024 * 1024);
        assert_eq!(plan.strategy, Strategy::ParallelRanged);
        assert_eq!(plan.chunk_count, 8);
        assert_eq!(plan.chunk_size, 13_107_200);
    }

    #[test]
    fn test_plan_falls_back_to_single_stream() {
        assert_eq!(
            AcquisitionPlan::decide(&probe(0), 8, 1024).strategy,
            Strategy::SingleStream
        );
        assert_eq!(
            AcquisitionPlan::decide(&probe(1000), 8, 1024).strategy,
            Strategy::SingleStream
        );
        let refused = ProbeResult {
            accepts_ranges: false,
            ..probe(1 << 30)
        };
        assert_eq!(
            AcquisitionPlan::decide(&refused, 8, 1024).strategy,
            Strategy::SingleStream
        );
        assert_eq!(
            AcquisitionPlan::decide(&probe(1 << 30), 1, 1024).strategy,
            Strategy::SingleStream
        );
    }

    #[test]
    fn test_ranges_cover_exactly() {
        for (total, chunks) in [(1000u64, 8usize), (17, 16), (16, 16), (5, 16), (1 << 20, 3)] {
            let plan = AcquisitionPlan::decide(&probe(total), chunks, 1);
            let ranges = plan.ranges();
            assert_eq!(ranges.len(), plan.chunk_count);
            assert_eq!(ranges[0].0, 0);
            assert_eq!(ranges.last().unwrap().1, total - 1);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].1 + 1, pair[1].0);
            }
        }
    }

    #[test]
    fn test_small_totals_shrink_chunk_count() {
        let plan = AcquisitionPlan::decide(&probe(5), 16, 1);
        assert_eq!(plan.chunk_size, 1);
        assert_eq!(plan.chunk_count, 5);
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(
            disposition_filename("attachment; filename=\"movie.mkv\""),
            Some("movie.mkv".to_string())
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[tokio::test]
    async fn test_tracker_counts_and_resets() {
        let tracker = TransferTracker::new(100, ProgressReporter::noop());
        assert_eq!(tracker.add(40), 40);
        assert_eq!(tracker.add(10), 50);
        tracker.reset();
        assert_eq!(tracker.downloaded(), 0);
    }
}
