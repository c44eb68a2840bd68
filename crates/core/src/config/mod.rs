//! Process-wide configuration.
//!
//! One YAML document, loaded once at startup and validated before the
//! service binds its port. A validation failure is fatal.

pub mod error;
pub mod loader;
pub mod models;

pub use error::{ConfigError, ConfigResult};
pub use loader::load_config;
pub use models::{
    AppConfig, ContainerConfig, LocalConfig, MicroscopePreset, SlurmDefaults, ToolConfig,
    ToolExecution,
};
