//! Magnet and `.torrent` sources through an external torrent engine.
//!
//! The engine downloads into `{jobId}_torrent/`; the core only polls it and,
//! once everything is complete, keeps the largest file in that tree.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{JobPaths, TempPath, ensure_dir_all};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::transcode::runner::spawn_error;
use crate::utils::format::{format_eta, format_rate};
use crate::{Error, Result};

/// Fields requested from every `tellX` call.
const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "connections",
    "errorMessage",
    "bittorrent",
];
const RPC_READY_ATTEMPTS: u32 = 40;
const RPC_READY_DELAY: Duration = Duration::from_millis(250);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentState {
    /// Resolving a magnet link into torrent metadata.
    Metadata,
    Downloading,
    Finished,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStatus {
    pub fraction: f64,
    pub peers: u32,
    /// Bytes per second.
    pub rate: u64,
    pub total_bytes: u64,
    pub state: TorrentState,
}

/// A running torrent download.
#[async_trait]
pub trait TorrentHandle: Send {
    async fn poll(&mut self) -> Result<TorrentStatus>;
    /// Stop the engine; must be safe to call after completion or failure.
    async fn stop(&mut self);
}

#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Start downloading `source` (magnet URI or `.torrent` path/URL) into `dir`.
    async fn start(
        &self,
        source: &str,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn TorrentHandle>>;
}

/// Download a torrent into the job's temp tree and return the directory guard
/// plus the chosen payload file.
pub async fn fetch_torrent(
    engine: &dyn TorrentEngine,
    source: &str,
    paths: &JobPaths,
    limit: u64,
    poll_interval: Duration,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<(TempPath, PathBuf)> {
    let dir = TempPath::new(paths.file("torrent", ""));
    ensure_dir_all(dir.path()).await?;

    let mut handle = engine.start(source, dir.path(), cancel).await?;
    let outcome = poll_until_done(handle.as_mut(), limit, poll_interval, reporter, cancel).await;
    handle.stop().await;
    outcome?;

    let payload = largest_file(dir.path())
        .await?
        .ok_or_else(|| Error::unreachable("torrent finished without any files"))?;
    info!(file = %payload.display(), "Torrent complete");
    reporter.complete("");
    Ok((dir, payload))
}

async fn poll_until_done(
    handle: &mut dyn TorrentHandle,
    limit: u64,
    poll_interval: Duration,
    reporter: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = ticker.tick() => {}
        }

        let status = handle.poll().await?;
        if status.total_bytes > limit {
            return Err(Error::TooLarge {
                limit,
                actual: status.total_bytes,
            });
        }

        match &status.state {
            TorrentState::Finished => return Ok(()),
            TorrentState::Failed(reason) => return Err(Error::unreachable(reason.clone())),
            TorrentState::Metadata => reporter.report_event(
                ProgressEvent::new(reporter.stage(), 0, format_rate(status.rate as f64), "-")
                    .with_detail(format!("fetching metadata, {} peers", status.peers)),
            ),
            TorrentState::Downloading => {
                let remaining = status.total_bytes as f64 * (1.0 - status.fraction);
                let eta = if status.rate > 0 {
                    remaining / status.rate as f64
                } else {
                    0.0
                };
                reporter.report_event(
                    ProgressEvent::new(
                        reporter.stage(),
                        (status.fraction * 100.0).floor().clamp(0.0, 100.0) as u8,
                        format_rate(status.rate as f64),
                        format_eta(eta),
                    )
                    .with_detail(format!("{} peers", status.peers)),
                );
            }
        }
    }
}

/// Largest regular file under `root`, ignoring engine control files.
pub async fn largest_file(root: &Path) -> Result<Option<PathBuf>> {
    let mut pending = vec![root.to_path_buf()];
    let mut best: Option<(u64, PathBuf)> = None;

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::io_path("reading", &dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path("reading", &dir, e))?
        {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                pending.push(path);
            } else if meta.is_file()
                && path.extension().is_none_or(|e| e != "aria2")
                && best.as_ref().is_none_or(|(size, _)| meta.len() > *size)
            {
                best = Some((meta.len(), path));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// One entry of an aria2 `tellX` response. aria2 encodes numbers as strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Aria2Download {
    pub gid: String,
    pub status: String,
    pub total_length: String,
    pub completed_length: String,
    pub download_speed: String,
    pub connections: String,
    pub error_message: Option<String>,
    pub bittorrent: Option<Value>,
}

impl Aria2Download {
    fn num(value: &str) -> u64 {
        value.parse().unwrap_or(0)
    }

    /// Magnet metadata downloads carry no `info` dictionary.
    fn is_metadata(&self) -> bool {
        self.bittorrent
            .as_ref()
            .is_some_and(|bt| bt.get("info").is_none())
    }
}

/// Reduce the three aria2 queues to one status.
pub fn summarize(
    active: &[Aria2Download],
    waiting: &[Aria2Download],
    stopped: &[Aria2Download],
) -> TorrentStatus {
    let live: Vec<&Aria2Download> = active.iter().chain(waiting).collect();
    let peers: u32 = live.iter().map(|d| Aria2Download::num(&d.connections) as u32).sum();
    let rate: u64 = live.iter().map(|d| Aria2Download::num(&d.download_speed)).sum();

    if let Some(failed) = stopped
        .iter()
        .find(|d| d.status == "error" || d.status == "removed")
    {
        return TorrentStatus {
            fraction: 0.0,
            peers,
            rate,
            total_bytes: 0,
            state: TorrentState::Failed(
                failed
                    .error_message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("torrent download {}", failed.status)),
            ),
        };
    }

    if live.is_empty() {
        let payload_done = stopped
            .iter()
            .any(|d| !d.is_metadata() && d.status == "complete");
        let state = if payload_done {
            TorrentState::Finished
        } else {
            TorrentState::Metadata
        };
        let total_bytes: u64 = stopped
            .iter()
            .filter(|d| !d.is_metadata())
            .map(|d| Aria2Download::num(&d.total_length))
            .sum();
        return TorrentStatus {
            fraction: if state == TorrentState::Finished { 1.0 } else { 0.0 },
            peers,
            rate,
            total_bytes,
            state,
        };
    }

    let payload: Vec<&&Aria2Download> = live.iter().filter(|d| !d.is_metadata()).collect();
    let total: u64 = payload.iter().map(|d| Aria2Download::num(&d.total_length)).sum();
    let completed: u64 = payload
        .iter()
        .map(|d| Aria2Download::num(&d.completed_length))
        .sum();

    if payload.is_empty() || total == 0 {
        return TorrentStatus {
            fraction: 0.0,
            peers,
            rate,
            total_bytes: 0,
            state: TorrentState::Metadata,
        };
    }

    TorrentStatus {
        fraction: (completed as f64 / total as f64).min(1.0),
        peers,
        rate,
        total_bytes: total,
        state: TorrentState::Downloading,
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

/// aria2c started in RPC mode, one process per torrent.
#[derive(Debug, Clone)]
pub struct Aria2Engine {
    program: String,
    client: reqwest::Client,
}

impl Aria2Engine {
    pub fn new(program: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            program: program.into(),
            client,
        }
    }
}

#[async_trait]
impl TorrentEngine for Aria2Engine {
    async fn start(
        &self,
        source: &str,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn TorrentHandle>> {
        let port = free_port()?;
        let secret = uuid::Uuid::new_v4().simple().to_string();

        let mut command = process_utils::tokio_command(&self.program);
        command
            .arg("--enable-rpc")
            .arg(format!("--rpc-listen-port={port}"))
            .arg(format!("--rpc-secret={secret}"))
            .arg("--rpc-listen-all=false")
            .arg(format!("--dir={}", dir.display()))
            .args([
                "--seed-time=0",
                "--follow-torrent=mem",
                "--bt-save-metadata=false",
                "--file-allocation=none",
                "--summary-interval=0",
                "--console-log-level=warn",
            ])
            .arg(source)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let child = command.spawn().map_err(|e| spawn_error(&self.program, e))?;
        debug!(port, "Started aria2c");

        let mut handle = Aria2Handle {
            child,
            client: self.client.clone(),
            endpoint: format!("http://127.0.0.1:{port}/jsonrpc"),
            secret,
        };
        if let Err(e) = handle.wait_ready(cancel).await {
            let _ = handle.child.kill().await;
            return Err(e);
        }
        Ok(Box::new(handle))
    }
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

struct Aria2Handle {
    child: Child,
    client: reqwest::Client,
    endpoint: String,
    secret: String,
}

impl Aria2Handle {
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let mut all = vec![json!(format!("token:{}", self.secret))];
        all.extend(params);
        let body = json!({
            "jsonrpc": "2.0",
            "id": "vidforge",
            "method": method,
            "params": all,
        });

        let response: RpcResponse<T> = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        match (response.result, response.error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Err(Error::unreachable(format!("{method}: {}", error.message))),
            (None, None) => Err(Error::unreachable(format!("{method}: empty response"))),
        }
    }

    async fn wait_ready(&mut self, cancel: &CancellationToken) -> Result<()> {
        for _ in 0..RPC_READY_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Some(status) = self.child.try_wait()? {
                return Err(Error::ProcessFailed {
                    code: status.code(),
                    diagnostic: "aria2c exited before its RPC server came up".to_string(),
                });
            }
            let ready = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                res = self.call::<Value>("aria2.getVersion", vec![]) => res.is_ok(),
            };
            if ready {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(RPC_READY_DELAY) => {}
            }
        }
        Err(Error::ToolUnavailable("aria2c RPC server did not start".to_string()))
    }
}

#[async_trait]
impl TorrentHandle for Aria2Handle {
    async fn poll(&mut self) -> Result<TorrentStatus> {
        let keys = json!(STATUS_KEYS);
        let active: Vec<Aria2Download> = self.call("aria2.tellActive", vec![keys.clone()]).await?;
        let waiting: Vec<Aria2Download> = self
            .call("aria2.tellWaiting", vec![json!(0), json!(100), keys.clone()])
            .await?;
        let stopped: Vec<Aria2Download> = self
            .call("aria2.tellStopped", vec![json!(0), json!(100), keys])
            .await?;
        Ok(summarize(&active, &waiting, &stopped))
    }

    async fn stop(&mut self) {
        if let Err(e) = self.call::<Value>("aria2.forceShutdown", vec![]).await {
            debug!(error = %e, "aria2 shutdown call failed");
        }
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("aria2c did not exit, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn download(status: &str, total: u64, done: u64) -> Aria2Download {
        Aria2Download {
            gid: "1".into(),
            status: status.into(),
            total_length: total.to_string(),
            completed_length: done.to_string(),
            download_speed: "1000".into(),
            connections: "4".into(),
            error_message: None,
            bittorrent: Some(json!({"info": {"name": "movie"}})),
        }
    }

    fn metadata() -> Aria2Download {
        Aria2Download {
            bittorrent: Some(json!({})),
            ..download("active", 0, 0)
        }
    }

    #[test]
    fn test_summarize_downloading() {
        let status = summarize(&[download("active", 1000, 250)], &[], &[metadata_done()]);
        assert_eq!(status.state, TorrentState::Downloading);
        assert_eq!(status.fraction, 0.25);
        assert_eq!(status.peers, 4);
        assert_eq!(status.rate, 1000);
        assert_eq!(status.total_bytes, 1000);
    }

    fn metadata_done() -> Aria2Download {
        Aria2Download {
            status: "complete".into(),
            ..metadata()
        }
    }

    #[test]
    fn test_summarize_metadata_phase() {
        assert_eq!(summarize(&[metadata()], &[], &[]).state, TorrentState::Metadata);
        assert_eq!(summarize(&[], &[], &[]).state, TorrentState::Metadata);

        // Metadata fetched, payload download not queued yet.
        let between = summarize(&[], &[], &[metadata_done()]);
        assert_eq!(between.state, TorrentState::Metadata);
        assert_eq!(between.fraction, 0.0);
        assert_eq!(between.total_bytes, 0);
    }

    #[test]
    fn test_summarize_finished_and_failed() {
        let done = summarize(&[], &[], &[metadata_done(), download("complete", 1000, 1000)]);
        assert_eq!(done.state, TorrentState::Finished);
        assert_eq!(done.total_bytes, 1000);

        let mut broken = download("error", 1000, 10);
        broken.error_message = Some("No peers".into());
        let failed = summarize(&[], &[], &[broken]);
        assert_eq!(failed.state, TorrentState::Failed("No peers".into()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_start_honours_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let tool = crate::utils::testing::fake_tool(dir.path(), "aria2c", "sleep 30");
        let engine = Aria2Engine::new(
            tool.to_string_lossy(),
            crate::utils::http_client::build_client().unwrap(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.start("magnet:?xt=urn:btih:abc", dir.path(), &cancel),
        )
        .await
        .expect("start should return once cancelled");
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_largest_file_recurses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Movie/Sample")).unwrap();
        std::fs::write(dir.path().join("Movie/Sample/sample.mkv"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("Movie/movie.mkv"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("Movie/movie.mkv.aria2"), vec![0u8; 500]).unwrap();

        let found = largest_file(dir.path()).await.unwrap().unwrap();
        assert_eq!(found, dir.path().join("Movie/movie.mkv"));
    }

    struct ScriptedEngine {
        statuses: parking_lot::Mutex<Option<VecDeque<TorrentStatus>>>,
    }

    struct ScriptedHandle {
        dir: PathBuf,
        statuses: VecDeque<TorrentStatus>,
    }

    #[async_trait]
    impl TorrentEngine for ScriptedEngine {
        async fn start(
            &self,
            _source: &str,
            dir: &Path,
            _cancel: &CancellationToken,
        ) -> Result<Box<dyn TorrentHandle>> {
            let statuses = self.statuses.lock().take().unwrap_or_default();
            Ok(Box::new(ScriptedHandle {
                dir: dir.to_path_buf(),
                statuses,
            }))
        }
    }

    #[async_trait]
    impl TorrentHandle for ScriptedHandle {
        async fn poll(&mut self) -> Result<TorrentStatus> {
            let status = self.statuses.pop_front().expect("script exhausted");
            if status.state == TorrentState::Finished {
                std::fs::write(self.dir.join("payload.mp4"), vec![1u8; 64]).unwrap();
                std::fs::write(self.dir.join("readme.txt"), b"hi").unwrap();
            }
            Ok(status)
        }

        async fn stop(&mut self) {}
    }

    fn status(state: TorrentState, fraction: f64, total: u64) -> TorrentStatus {
        TorrentStatus {
            fraction,
            peers: 3,
            rate: 100,
            total_bytes: total,
            state,
        }
    }

    fn engine(script: Vec<TorrentStatus>) -> ScriptedEngine {
        ScriptedEngine {
            statuses: parking_lot::Mutex::new(Some(script.into())),
        }
    }

    #[tokio::test]
    async fn test_fetch_torrent_picks_largest() {
        let root = tempfile::tempdir().unwrap();
        let paths = JobPaths::new(root.path(), "t1");
        let engine = engine(vec![
            status(TorrentState::Metadata, 0.0, 0),
            status(TorrentState::Downloading, 0.5, 64),
            status(TorrentState::Finished, 1.0, 64),
        ]);

        let (dir, payload) = fetch_torrent(
            &engine,
            "magnet:?xt=urn:btih:abc",
            &paths,
            1 << 20,
            Duration::from_millis(5),
            &ProgressReporter::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(payload, root.path().join("t1_torrent/payload.mp4"));

        let tree = dir.path().to_path_buf();
        drop(dir);
        assert!(!tree.exists());
    }

    #[tokio::test]
    async fn test_fetch_torrent_failure_cleans_dir() {
        let root = tempfile::tempdir().unwrap();
        let paths = JobPaths::new(root.path(), "t2");
        let engine = engine(vec![status(TorrentState::Failed("tracker error".into()), 0.0, 0)]);

        let err = fetch_torrent(
            &engine,
            "magnet:?xt=urn:btih:abc",
            &paths,
            1 << 20,
            Duration::from_millis(5),
            &ProgressReporter::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::UnreachableOrRejected(_)));
        assert!(!root.path().join("t2_torrent").exists());
    }

    #[tokio::test]
    async fn test_fetch_torrent_size_cap() {
        let root = tempfile::tempdir().unwrap();
        let paths = JobPaths::new(root.path(), "t3");
        let engine = engine(vec![status(TorrentState::Downloading, 0.1, 10_000)]);

        let err = fetch_torrent(
            &engine,
            "magnet:?xt=urn:btih:abc",
            &paths,
            1000,
            Duration::from_millis(5),
            &ProgressReporter::noop(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TooLarge { limit: 1000, actual: 10_000 }));
    }
}
