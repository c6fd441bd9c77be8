//! Supervision of external processes.
//!
//! Children are always spawned with `kill_on_drop`, and every wait races the
//! job's cancellation token so a cancelled job never leaves a process behind.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Output, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::progress_parser::{ProgressMarker, ProgressState};
use crate::progress::ProgressReporter;
use crate::utils::format::{format_eta, tail_chars};
use crate::{Error, Result};

/// Characters of stderr kept for a failure report.
pub const DIAGNOSTIC_TAIL_CHARS: usize = 800;

/// Map a spawn failure: a missing binary is `ToolUnavailable`.
pub fn spawn_error(program: impl AsRef<OsStr>, err: std::io::Error) -> Error {
    let name = program.as_ref().to_string_lossy().into_owned();
    if process_utils::is_missing_program(&err) {
        Error::ToolUnavailable(format!("{name} not found"))
    } else {
        Error::Other(format!("Failed to spawn {name}: {err}"))
    }
}

/// Wait for `child` to exit, killing it if `cancel` fires first.
pub async fn wait_or_kill(child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus> {
    tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill cancelled process");
            }
            Err(Error::Cancelled)
        }
        status = child.wait() => {
            let status = status?;
            if let Some(code) = status.code()
                && code != 0
            {
                debug!(code, "Process exited with non-zero code");
            }
            Ok(status)
        }
    }
}

/// Run a command to completion and capture its output, honouring cancellation.
pub async fn run_capture(mut command: Command, cancel: &CancellationToken) -> Result<Output> {
    let program = command.as_std().get_program().to_os_string();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command.spawn().map_err(|e| spawn_error(&program, e))?;

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        output = child.wait_with_output() => Ok(output?),
    }
}

/// Spawn a task that drains `reader` line by line, logging each line at debug
/// level and returning the last `max_chars` characters.
pub fn collect_tail<R>(reader: R, max_chars: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut buffer = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("stderr: {}", line);
            buffer.push_str(&line);
            buffer.push('\n');
            if buffer.len() > max_chars * 8 {
                buffer = tail_chars(&buffer, max_chars);
            }
        }
        tail_chars(&buffer, max_chars)
    })
}

/// One ffmpeg invocation.
#[derive(Debug, Clone)]
pub struct FfmpegInvocation<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: Option<&'a Path>,
    /// Input duration used to turn `out_time` into a percentage.
    pub duration_secs: f64,
}

/// Run ffmpeg with `-progress pipe:1`, feeding the reporter as blocks arrive.
///
/// A zero exit emits the final 100% event. A non-zero exit becomes
/// `ProcessFailed` carrying the last [`DIAGNOSTIC_TAIL_CHARS`] characters of
/// stderr. Cancellation kills the process and returns `Cancelled`.
pub async fn run_ffmpeg(
    invocation: FfmpegInvocation<'_>,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut command = process_utils::tokio_command(invocation.program);
    command
        .args(&invocation.args)
        .env("LC_ALL", "C")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = invocation.cwd {
        command.current_dir(dir);
    }
    debug!(args = ?invocation.args, "Spawning ffmpeg");

    let mut child = command
        .spawn()
        .map_err(|e| spawn_error(invocation.program, e))?;
    let stderr_tail = child
        .stderr
        .take()
        .map(|stderr| collect_tail(stderr, DIAGNOSTIC_TAIL_CHARS));

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        let mut state = ProgressState::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    if let Some(task) = &stderr_tail {
                        task.abort();
                    }
                    return Err(Error::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if state.feed(&line).is_some_and(|m| m == ProgressMarker::Continue) {
                            let speed = state.speed.map(|s| format!("{s:.2}x")).unwrap_or_default();
                            progress.report(
                                state.percent(invocation.duration_secs),
                                speed,
                                format_eta(state.eta_secs(invocation.duration_secs)),
                            );
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed to read ffmpeg progress");
                        break;
                    }
                }
            }
        }
    }

    let status = wait_or_kill(&mut child, cancel).await;
    let diagnostic = match stderr_tail {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    let status = status?;

    if !status.success() {
        return Err(Error::ProcessFailed {
            code: status.code(),
            diagnostic,
        });
    }
    progress.complete("done");
    Ok(())
}
