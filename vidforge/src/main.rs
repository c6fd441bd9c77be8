//! Line-oriented console front end.
//!
//! Each stdin line is one transport event. Delivered artifacts are moved into
//! `OUTPUT_DIR`; uploads are local file paths.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vidforge::acquire::{Acquirer, UploadFetcher};
use vidforge::config::AppConfig;
use vidforge::jobs::{JobId, JobKind};
use vidforge::logging::{Logging, init_logging};
use vidforge::orchestrator::{Artifact, Orchestrator, Parameter, Response, Transport};
use vidforge::progress::ProgressReporter;
use vidforge::session::Source;
use vidforge::transcode::TranscodeEngine;
use vidforge::utils::format::{format_elapsed, format_size};
use vidforge::utils::http_client::build_client;
use vidforge::{Error, Result};

const HELP: &str = "\
commands:
  send <path>              upload a local video
  <link>                   direct link, stream page or magnet
  op <operation> [token]   download | subtitles | resolution | compress | streams | info
  sub <path|url>           subtitle file for a burn
  res <720p|WxH>           target resolution
  size <mb>                compression target
  format <n>               quality menu entry
  stream <index> <format>  stream to extract
  quality <preset> <crf>   encoder preference (or 'quality auto')
  jobs | kill <id> | cancel | loglevel <directive> | quit";

struct ConsoleTransport {
    output_dir: PathBuf,
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn render(&self, user: &str, text: &str) {
        println!("[{user}] {text}");
    }

    async fn deliver(&self, user: &str, artifact: Artifact) -> Result<()> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| Error::io_path("creating", &self.output_dir, e))?;
        let dest = self.output_dir.join(&artifact.file_name);
        // Rename fails across filesystems; fall back to a copy.
        if tokio::fs::rename(&artifact.path, &dest).await.is_err() {
            tokio::fs::copy(&artifact.path, &dest)
                .await
                .map_err(|e| Error::io_path("copying", &artifact.path, e))?;
        }
        println!(
            "[{user}] Job {} done: {} ({}, {})",
            artifact.job_id,
            dest.display(),
            format_size(artifact.size),
            format_elapsed(artifact.elapsed)
        );
        Ok(())
    }
}

/// Uploads are paths on this machine.
struct LocalUploads;

#[async_trait]
impl UploadFetcher for LocalUploads {
    async fn fetch(
        &self,
        file_ref: &str,
        dest: &Path,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let src = Path::new(file_ref);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::fs::copy(src, dest) => {
                res.map_err(|e| Error::io_path("copying", src, e))?;
                reporter.complete("");
                Ok(())
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(AppConfig::from_env()?);
    let logging = init_logging(&config.log)?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    for tool in [
        &config.tools.ffmpeg,
        &config.tools.ffprobe,
        &config.tools.ytdlp,
        &config.tools.aria2c,
    ] {
        if process_utils::find_program(tool).is_none() {
            warn!(tool = %tool, "Tool not found on PATH, related operations will fail");
        }
    }

    let user = std::env::var("CONSOLE_USER").unwrap_or_else(|_| "console".to_string());
    let output_dir = std::env::var("OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("vidforge-out"));

    let client = build_client()?;
    let acquirer = Arc::new(Acquirer::from_config(&config, client, Arc::new(LocalUploads)));
    let engine = Arc::new(TranscodeEngine::from_config(&config));
    let transport = Arc::new(ConsoleTransport { output_dir });
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&config), acquirer, engine, transport));

    info!(user = %user, temp_dir = %config.temp_dir.display(), "vidforge ready");
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        match handle_line(&orchestrator, &logging, &user, line).await {
            Ok(Some(text)) => println!("[{user}] {text}"),
            Ok(None) => {}
            Err(e) => println!("[{user}] {}", e.user_message()),
        }
    }

    orchestrator.on_cancel(&user);
    shutdown.cancel();
    Ok(())
}

async fn handle_line(
    orchestrator: &Arc<Orchestrator>,
    logging: &Logging,
    user: &str,
    line: &str,
) -> Result<Option<String>> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let response = match command {
        "help" => return Ok(Some(HELP.to_string())),
        "send" => {
            let path = Path::new(rest);
            let size = tokio::fs::metadata(path)
                .await
                .map_err(|e| Error::io_path("reading", path, e))?
                .len();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| rest.to_string());
            let source = Source::Upload {
                file_ref: rest.to_string(),
                name,
                size,
            };
            orchestrator.on_new_source(user, source)
        }
        "op" => {
            let mut parts = rest.split_whitespace();
            let op: JobKind = parts
                .next()
                .unwrap_or_default()
                .parse()
                .map_err(|_| Error::unsupported(format!("operation '{rest}'")))?;
            orchestrator
                .on_operation_chosen(user, op, parts.next())
                .await?
        }
        "sub" => {
            let parameter = if rest.starts_with("http://") || rest.starts_with("https://") {
                Parameter::SubtitleUrl(rest.to_string())
            } else {
                let path = Path::new(rest);
                let size = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| Error::io_path("reading", path, e))?
                    .len();
                Parameter::SubtitleUpload {
                    file_ref: rest.to_string(),
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    size,
                }
            };
            orchestrator.on_parameter(user, parameter, None).await?
        }
        "res" => {
            orchestrator
                .on_parameter(user, Parameter::Resolution(rest.to_string()), None)
                .await?
        }
        "size" => {
            orchestrator
                .on_parameter(user, Parameter::CompressTarget(rest.to_string()), None)
                .await?
        }
        "format" => {
            let choice = rest
                .parse()
                .map_err(|_| Error::unsupported(format!("quality choice '{rest}'")))?;
            orchestrator
                .on_parameter(user, Parameter::Format(choice), None)
                .await?
        }
        "stream" => {
            let (index, format) = rest
                .split_once(' ')
                .and_then(|(i, f)| Some((i.trim_start_matches('#').parse().ok()?, f.trim())))
                .ok_or_else(|| Error::unsupported("expected 'stream <index> <format>'"))?;
            let parameter = Parameter::Stream {
                index,
                format: format.to_string(),
            };
            orchestrator.on_parameter(user, parameter, None).await?
        }
        "quality" => orchestrator.set_quality(user, rest)?,
        "cancel" => orchestrator.on_cancel(user),
        "jobs" => return Ok(Some(orchestrator.render_jobs(user))),
        "kill" => {
            let cancelled = orchestrator.cancel_job(user, &JobId::from(rest))?;
            let text = if cancelled {
                format!("Cancelling job {rest}.")
            } else {
                format!("No running job {rest}.")
            };
            return Ok(Some(text));
        }
        "loglevel" => {
            if rest.is_empty() {
                return Ok(Some(logging.filter()));
            }
            logging.set_filter(rest)?;
            return Ok(Some(format!("Log filter set to {rest}")));
        }
        _ => orchestrator.on_link(user, line)?,
    };

    Ok(match response {
        Response::Prompt(text) => Some(text),
        Response::Started { job_id, .. } => Some(format!("Started job {job_id}.")),
    })
}
