//! Progress events streamed to UI subscribers.
//!
//! The watcher publishes a [`ProgressEvent`] whenever any job's derived
//! status changes or the aggregate counters move. Events use tagged
//! serialization for TypeScript compatibility:
//!
//! ```json
//! {
//!   "type": "progress",
//!   "payload": {
//!     "jobs": { "import_movies": "succeeded" },
//!     "counters": { "total": 3, "succeeded": 1, "running": 1, "failed": 0 },
//!     "complete": false
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::job_models::{JobKind, JobStatus};

/// Aggregate counters over the processes file.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, TS)]
pub struct ProgressCounters {
    pub total: usize,
    pub succeeded: usize,
    pub running: usize,
    pub failed: usize,
}

/// Per-job statuses plus aggregate counters for one project.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, TS)]
pub struct ProgressSnapshot {
    pub jobs: BTreeMap<JobKind, JobStatus>,
    pub counters: ProgressCounters,
    /// True once every scheduled process has reached a terminal state.
    pub complete: bool,
}

impl ProgressSnapshot {
    /// A pipeline is complete when nothing is running and at least one
    /// process has been scheduled.
    pub fn compute_complete(counters: &ProgressCounters) -> bool {
        counters.running == 0 && counters.total > 0
    }
}

/// Events delivered over the progress stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ProgressEvent {
    /// Per-job status or counter delta.
    Progress(ProgressSnapshot),

    /// The processes file has been unreadable for several consecutive
    /// ticks; the watcher keeps retrying.
    WatcherWarning { message: String },

    /// The supervised pipeliner exited.
    PipelineFinished { exit_code: Option<i32> },
}
