//! Error taxonomy of the orchestration core.
//!
//! Configuration errors are separate ([`crate::config::ConfigError`]) and
//! fatal at startup; everything else funnels through [`CoreError`] so that
//! the wire surface can map failures to stable kinds.

use std::path::PathBuf;

use cb_protocol::{ErrorKind, JobKind};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors produced by state, project, scheme, runner and watcher operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Per-field validation failure; state is unchanged.
    #[error("validation failed for '{field}': {reason}")]
    Validation { field: String, reason: String },

    /// Mutation targeted a job record (or the globals) that the pipeline
    /// currently owns.
    #[error("'{target}' is frozen while the pipeline owns it")]
    FrozenJob { target: String },

    /// Operation requires an idle pipeline.
    #[error("pipeline is active")]
    PipelineActive,

    /// No project is open in this store.
    #[error("no project is open")]
    NoProject,

    /// Abort requested while nothing is running.
    #[error("no pipeline is running")]
    NotRunning,

    /// Data import collided with a previous import of a different source.
    #[error("duplicate import of '{mdoc}': already imported from {existing}")]
    DuplicateImport { mdoc: String, existing: String },

    /// Project directory already exists.
    #[error("project directory '{path}' already exists")]
    ProjectExists { path: PathBuf },

    /// Glob pattern failed to parse or matched nothing where required.
    #[error("bad glob pattern '{pattern}': {reason}")]
    BadGlob { pattern: String, reason: String },

    /// Project path or snapshot not found.
    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    /// Snapshot exists but failed validation.
    #[error("invalid snapshot at {path}: {reason}")]
    SnapshotInvalid { path: PathBuf, reason: String },

    /// A required global parameter is unset at command-build time.
    #[error("job '{kind}' is missing required parameter '{field}'")]
    MissingParameter { kind: JobKind, field: String },

    /// Filesystem failure with path context.
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// STAR document failed to parse or carried an unexpected shape.
    #[error("STAR error in {path}: {reason}")]
    Star { path: PathBuf, reason: String },

    /// A subprocess exited non-zero.
    #[error("command failed: {command}: {stderr}")]
    Subprocess { command: String, stderr: String },

    /// A bounded shell call did not finish in time.
    #[error("command timed out: {command}")]
    Timeout { command: String },

    /// Process-wide configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoreError {
    /// Helper for filesystem errors with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// The stable machine-readable kind reported to the UI.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation { .. } => ErrorKind::ValidationError,
            CoreError::FrozenJob { .. } => ErrorKind::FrozenJob,
            CoreError::PipelineActive => ErrorKind::PipelineActive,
            CoreError::NoProject => ErrorKind::NoProject,
            CoreError::NotRunning => ErrorKind::NotRunning,
            CoreError::DuplicateImport { .. } => ErrorKind::DuplicateImport,
            CoreError::ProjectExists { .. } => ErrorKind::Exists,
            CoreError::BadGlob { .. } => ErrorKind::BadGlob,
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::SnapshotInvalid { .. } => ErrorKind::SnapshotInvalid,
            CoreError::MissingParameter { .. } => ErrorKind::MissingParameter,
            CoreError::Io { .. } => ErrorKind::Io,
            CoreError::Star { .. } => ErrorKind::Io,
            CoreError::Subprocess { .. } | CoreError::Timeout { .. } => ErrorKind::Subprocess,
            CoreError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Type alias for Result with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
