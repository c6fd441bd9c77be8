//! In-flight job tracking.

mod context;
mod registry;

pub use context::JobContext;
pub use registry::{JobGuard, JobId, JobInfo, JobKind, JobRegistry};
