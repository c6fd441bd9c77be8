//! Progress events and the rate-limited reporter every stage emits through.
//!
//! Producers (range downloads, ffmpeg, yt-dlp, the torrent poller) may call
//! [`ProgressReporter::report`] as often as they like. The reporter owns the
//! throttle state: at most one event per interval leaves it, percentages never
//! go backwards, and 100 is reserved for [`ProgressReporter::complete`], which
//! emits it exactly once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Which part of a job produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "title_case")]
pub enum Stage {
    Uploading,
    Downloading,
    Preparing,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub percent: u8,
    pub throughput: String,
    pub eta: String,
    /// Extra label such as peer count or current pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, percent: u8, throughput: impl Into<String>, eta: impl Into<String>) -> Self {
        Self {
            stage,
            percent,
            throughput: throughput.into(),
            eta: eta.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub event: ProgressEvent,
}

/// Rate limiting and monotonicity for one stage of one job.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: u8,
    completed: bool,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_percent: 0,
            completed: false,
        }
    }

    /// Returns the event to emit, if any, after capping it at 99%.
    pub fn offer(&mut self, mut event: ProgressEvent, now: Instant) -> Option<ProgressEvent> {
        if self.completed {
            return None;
        }
        event.percent = event.percent.min(99).max(self.last_percent);
        if let Some(last) = self.last_emit
            && now.saturating_duration_since(last) < self.interval
        {
            return None;
        }
        self.last_emit = Some(now);
        self.last_percent = event.percent;
        Some(event)
    }

    /// The single 100% event, or `None` if already completed.
    pub fn complete(&mut self, mut event: ProgressEvent) -> Option<ProgressEvent> {
        if self.completed {
            return None;
        }
        self.completed = true;
        event.percent = 100;
        Some(event)
    }
}

/// Cheap cloneable handle; clones share the same throttle.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Arc<str>,
    stage: Stage,
    interval: Duration,
    tx: Option<mpsc::Sender<ProgressUpdate>>,
    throttle: Arc<Mutex<ProgressThrottle>>,
}

impl ProgressReporter {
    pub fn new(
        job_id: impl Into<String>,
        stage: Stage,
        interval: Duration,
        tx: mpsc::Sender<ProgressUpdate>,
    ) -> Self {
        Self {
            job_id: Arc::from(job_id.into()),
            stage,
            interval,
            tx: Some(tx),
            throttle: Arc::new(Mutex::new(ProgressThrottle::new(interval))),
        }
    }

    /// A reporter that drops everything.
    pub fn noop() -> Self {
        Self {
            job_id: Arc::from("noop"),
            stage: Stage::Processing,
            interval: Duration::ZERO,
            tx: None,
            throttle: Arc::new(Mutex::new(ProgressThrottle::new(Duration::ZERO))),
        }
    }

    /// A reporter for the next stage of the same job, with fresh throttle state.
    pub fn for_stage(&self, stage: Stage) -> Self {
        Self {
            job_id: self.job_id.clone(),
            stage,
            interval: self.interval,
            tx: self.tx.clone(),
            throttle: Arc::new(Mutex::new(ProgressThrottle::new(self.interval))),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn report(&self, percent: u8, throughput: impl Into<String>, eta: impl Into<String>) {
        self.report_event(ProgressEvent::new(self.stage, percent, throughput, eta));
    }

    pub fn report_event(&self, event: ProgressEvent) {
        let accepted = self.throttle.lock().offer(event, Instant::now());
        if let Some(event) = accepted {
            self.send(event, false);
        }
    }

    /// Emit the final 100% event. Later calls are ignored.
    pub fn complete(&self, throughput: impl Into<String>) {
        let event = ProgressEvent::new(self.stage, 100, throughput, "0s");
        let accepted = self.throttle.lock().complete(event);
        if let Some(event) = accepted {
            self.send(event, true);
        }
    }

    /// Intermediate events are dropped when the consumer lags; the completion
    /// event waits for room instead.
    fn send(&self, event: ProgressEvent, must_arrive: bool) {
        let Some(tx) = &self.tx else { return };
        let update = ProgressUpdate {
            job_id: self.job_id.to_string(),
            event,
        };
        match tx.try_send(update) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(update)) if must_arrive => {
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let tx = tx.clone();
                        runtime.spawn(async move {
                            let _ = tx.send(update).await;
                        });
                    }
                    Err(_) => warn!(
                        job_id = %self.job_id,
                        "Progress channel full outside a runtime, completion event dropped"
                    ),
                }
            }
            Err(TrySendError::Full(update)) => {
                trace!(job_id = %update.job_id, percent = update.event.percent, "Progress event dropped");
            }
        }
    }
}
