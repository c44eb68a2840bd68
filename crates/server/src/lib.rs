//! # cb-server
//!
//! HTTP/WebSocket surface of the CryoBoost server: project lifecycle
//! routes over the orchestration core plus one progress stream per
//! project.

pub mod error;
pub mod handlers;
pub mod registry;
pub mod routes;
pub mod ws;

pub use handlers::AppState;
pub use registry::{ProjectHandle, ProjectRegistry};
pub use routes::create_routes;
