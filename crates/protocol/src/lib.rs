//! # cb-protocol
//!
//! Shared data models for the CryoBoost server.
//!
//! This crate defines all structures shared between the orchestration core
//! and the HTTP surface:
//! - Project state and the `project_params.json` snapshot format
//! - Job identity, per-kind parameters and derived statuses
//! - Progress events streamed to UI subscribers
//! - The machine-readable error vocabulary
//!
//! ## Modules
//!
//! - [`job_models`]: JobKind, JobStatus, per-kind parameter records
//! - [`project_models`]: global parameter records and the Project snapshot
//! - [`events`]: progress deltas for the WebSocket stream
//! - [`error_models`]: stable error kinds
//!
//! ## Design Principles
//!
//! - Minimal dependencies: serde, ts-rs, chrono, uuid
//! - TypeScript generation: all wire types derive `TS`
//! - Independent compilation: no dependencies on other workspace crates

pub mod error_models;
pub mod events;
pub mod job_models;
pub mod project_models;

// Re-export all public types for convenience
pub use error_models::*;
pub use events::*;
pub use job_models::*;
pub use project_models::*;
