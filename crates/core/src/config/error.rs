//! Error types for configuration loading.
//!
//! Configuration errors are structured and fatal: the service refuses to
//! start when the document is missing, unparsable or inconsistent.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the YAML document.
    #[error("failed to parse YAML at {path}: {source}")]
    YamlParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// A required key is missing.
    #[error("missing required config key '{key}'")]
    MissingKey { key: String },

    /// A tool declares an impossible execution mode (both or neither of
    /// `binary` and `container`).
    #[error("tool '{tool}' must be exactly one of binary or container")]
    AmbiguousTool { tool: String },

    /// A container image path does not resolve to an existing file.
    #[error("container image for tool '{tool}' not found at {path}")]
    ContainerImageMissing { tool: String, path: PathBuf },

    /// Any other structural problem.
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// Type alias for Result with ConfigError.
pub type ConfigResult<T> = Result<T, ConfigError>;
