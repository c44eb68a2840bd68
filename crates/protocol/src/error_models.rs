//! Stable machine-readable error kinds for the wire surface.
//!
//! Every failure the server reports carries one of these kinds plus a
//! human message; the UI maps kinds to notifications.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// The error vocabulary of the wire surface.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Per-field validation failure; state unchanged.
    ValidationError,
    /// Mutation targeted a job that is running or terminal.
    FrozenJob,
    /// Operation requires an idle pipeline.
    PipelineActive,
    /// No project is open in this store.
    NoProject,
    /// Abort requested while nothing is running.
    NotRunning,
    /// Data import collided with a previous import from a different source.
    DuplicateImport,
    /// Project directory already exists.
    Exists,
    /// Glob pattern matched nothing or failed to parse.
    BadGlob,
    /// Project path or snapshot not found.
    NotFound,
    /// Snapshot exists but failed validation.
    SnapshotInvalid,
    /// A required global parameter is unset at command-build time.
    MissingParameter,
    /// Filesystem failure with path context.
    Io,
    /// Subprocess failure (pipeliner or scheduler probe).
    Subprocess,
    /// Process-wide configuration error.
    Config,
    /// Anything else.
    Internal,
}

/// Wire form of an error: stable kind plus human-readable message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}
