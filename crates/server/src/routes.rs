//! Route table.

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    abort_pipeline, create_project, deselect_job, get_server_config, get_state, health,
    open_project, reset_defaults, reset_head, select_job, set_global, set_job_field,
    start_pipeline, unlock_pipeline, AppState,
};
use crate::ws::progress_socket;

/// Build the full router over the shared application state.
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/config", get(get_server_config))
        .route("/api/projects", post(create_project))
        .route("/api/projects/open", post(open_project))
        .route("/api/projects/state", get(get_state))
        .route("/api/projects/global", post(set_global))
        .route("/api/projects/job-field", post(set_job_field))
        .route("/api/projects/select-job", post(select_job))
        .route("/api/projects/deselect-job", post(deselect_job))
        .route("/api/projects/reset-defaults", post(reset_defaults))
        .route("/api/pipeline/start", post(start_pipeline))
        .route("/api/pipeline/abort", post(abort_pipeline))
        .route("/api/pipeline/reset", post(reset_head))
        .route("/api/pipeline/unlock", post(unlock_pipeline))
        .route("/ws/progress", get(progress_socket))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
