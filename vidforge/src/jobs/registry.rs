//! Registry of running jobs.
//!
//! The only structure shared by concurrently running jobs. Callers go
//! through the verbs below and never see the map itself.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::utils::format::truncate_chars;
use crate::{Error, Result};

const DESCRIPTION_CHARS: usize = 60;

/// Opaque short job token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Eight hex characters taken from a random UUID.
    pub fn generate() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a job does. Doubles as the operation a user picks for a source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum JobKind {
    #[strum(to_string = "download", serialize = "acquire_only")]
    AcquireOnly,
    #[strum(to_string = "subtitles", serialize = "subtitle_burn")]
    SubtitleBurn,
    #[strum(to_string = "resolution", serialize = "resolution_change")]
    ResolutionChange,
    Compress,
    #[strum(to_string = "streams", serialize = "stream_extract")]
    StreamExtract,
    #[strum(to_string = "info", serialize = "media_info")]
    MediaInfo,
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AcquireOnly => "Download",
            Self::SubtitleBurn => "Burn subtitles",
            Self::ResolutionChange => "Change resolution",
            Self::Compress => "Compress",
            Self::StreamExtract => "Extract stream",
            Self::MediaInfo => "Media info",
        }
    }
}

/// Snapshot of a registered job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub owner: String,
    pub kind: JobKind,
    pub description: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct JobEntry {
    info: JobInfo,
    cancel: Option<CancellationToken>,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, JobEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job with status `starting`. Fails only on a duplicate id.
    pub fn register(
        &self,
        id: JobId,
        owner: impl Into<String>,
        kind: JobKind,
        description: &str,
    ) -> Result<JobInfo> {
        match self.jobs.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateJob(id.to_string())),
            Entry::Vacant(slot) => {
                let info = JobInfo {
                    id,
                    owner: owner.into(),
                    kind,
                    description: truncate_chars(description, DESCRIPTION_CHARS),
                    status: "starting".to_string(),
                    started_at: Utc::now(),
                };
                debug!(job_id = %info.id, kind = %info.kind, "Registered job");
                slot.insert(JobEntry {
                    info: info.clone(),
                    cancel: None,
                });
                Ok(info)
            }
        }
    }

    /// Replace the status label. Silently ignores unknown ids.
    pub fn update_status(&self, id: &JobId, status: impl Into<String>) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.info.status = status.into();
        }
    }

    /// Associate the job's cancellation handle, replacing any previous one.
    pub fn attach_cancellation(&self, id: &JobId, token: CancellationToken) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.cancel = Some(token);
        }
    }

    /// Remove the job. Idempotent.
    pub fn finish(&self, id: &JobId) {
        if self.jobs.remove(id).is_some() {
            debug!(job_id = %id, "Job finished");
        }
    }

    /// Signal the job's cancellation handle and remove it.
    pub fn cancel(&self, id: &JobId) -> bool {
        let Some((_, entry)) = self.jobs.remove(id) else {
            return false;
        };
        if let Some(token) = entry.cancel
            && !token.is_cancelled()
        {
            token.cancel();
        }
        info!(job_id = %id, owner = %entry.info.owner, "Job cancelled");
        true
    }

    /// Cancel every job owned by `owner`, returning the cancelled ids.
    pub fn cancel_owned_by(&self, owner: &str) -> Vec<JobId> {
        let ids: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|e| e.info.owner == owner)
            .map(|e| e.key().clone())
            .collect();
        ids.into_iter().filter(|id| self.cancel(id)).collect()
    }

    pub fn get(&self, id: &JobId) -> Option<JobInfo> {
        self.jobs.get(id).map(|e| e.info.clone())
    }

    /// Snapshot of all jobs, oldest first.
    pub fn list_all(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.iter().map(|e| e.info.clone()).collect();
        jobs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        jobs
    }

    pub fn list_for_owner(&self, owner: &str) -> Vec<JobInfo> {
        self.list_all()
            .into_iter()
            .filter(|j| j.owner == owner)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Calls [`JobRegistry::finish`] when dropped, so every exit path releases the job.
pub struct JobGuard {
    registry: Arc<JobRegistry>,
    id: JobId,
}

impl JobGuard {
    pub fn new(registry: Arc<JobRegistry>, id: JobId) -> Self {
        Self { registry, id }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.finish(&self.id);
    }
}
