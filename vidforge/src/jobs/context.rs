//! Per-job handles passed down into acquisition and transcoding.

use tokio_util::sync::CancellationToken;

use super::JobId;
use crate::cleanup::JobPaths;
use crate::progress::{ProgressReporter, Stage};
use crate::transcode::QualityPreference;
use crate::{Error, Result};

#[derive(Clone)]
pub struct JobContext {
    pub id: JobId,
    pub paths: JobPaths,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
    /// Per-job encoder override.
    pub preference: Option<QualityPreference>,
}

impl JobContext {
    pub fn new(
        id: JobId,
        paths: JobPaths,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            paths,
            progress,
            cancel,
            preference: None,
        }
    }

    pub fn with_preference(mut self, preference: Option<QualityPreference>) -> Self {
        self.preference = preference;
        self
    }

    /// Reporter for a stage of this job, with its own throttle.
    pub fn reporter(&self, stage: Stage) -> ProgressReporter {
        self.progress.for_stage(stage)
    }

    /// `Err(Cancelled)` once the job's token fired.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
