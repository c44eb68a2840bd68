//! Request handlers for the project and pipeline routes.
//!
//! Every mutation queues behind the target project's single-writer store
//! lock; reads are served from point-in-time snapshots. Responses carry
//! the full project snapshot so the UI never has to reassemble state from
//! deltas.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cb_core::config::AppConfig;
use cb_core::error::CoreError;
use cb_core::mdoc::{glob_parent, probe};
use cb_core::project::{create_layout, import_data};
use cb_core::scheme::materialize_scheme;
use cb_core::state::SNAPSHOT_FILE;
use cb_protocol::{GlobalGroup, JobKind, Project};

use crate::error::{ApiError, ApiResult};
use crate::registry::{ProjectHandle, ProjectRegistry};

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ProjectRegistry>,
    /// Server installation root; templates live under `templates/`.
    pub server_root: PathBuf,
}

impl AppState {
    pub fn scheme_templates_dir(&self) -> PathBuf {
        self.server_root
            .join("templates")
            .join("schemes")
            .join("warp_tomo_prep")
    }

    pub fn qsub_template(&self) -> PathBuf {
        self.server_root.join("templates").join("qsub").join("qsub.sh")
    }
}

/// The scheme written (and re-written) for a project's runs.
pub fn scheme_name_for(project: &Project) -> String {
    format!("scheme_{}", project.name)
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    /// Defaults to `local.default_project_base`.
    pub base: Option<String>,
    pub movies_glob: String,
    pub mdocs_glob: String,
    pub selected_jobs: Vec<JobKind>,
}

#[derive(Debug, Serialize)]
pub struct CreateProjectResponse {
    pub project_path: String,
}

#[derive(Debug, Deserialize)]
pub struct ProjectPathRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ProjectPathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct SetGlobalRequest {
    pub path: String,
    /// Field reference, `<group>.<field>`.
    pub field: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct SetJobFieldRequest {
    pub path: String,
    pub kind: JobKind,
    pub field: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct SelectJobRequest {
    pub path: String,
    pub kind: JobKind,
    pub position: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StartPipelineResponse {
    pub pid: u32,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// The configuration slice the UI needs to seed its forms.
#[derive(Debug, Serialize)]
pub struct ServerConfigResponse {
    pub default_project_base: String,
    pub default_movies_glob: Option<String>,
    pub default_mdocs_glob: Option<String>,
    pub microscopes: std::collections::BTreeMap<String, cb_core::config::MicroscopePreset>,
    pub aliases: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Defaults, microscope presets and parameter aliases for the UI.
pub async fn get_server_config(State(state): State<AppState>) -> Json<ServerConfigResponse> {
    Json(ServerConfigResponse {
        default_project_base: state.config.local.default_project_base.clone(),
        default_movies_glob: state.config.local.default_movies_glob.clone(),
        default_mdocs_glob: state.config.local.default_mdocs_glob.clone(),
        microscopes: state.config.microscopes.clone(),
        aliases: state.config.aliases.clone(),
    })
}

/// Create the project: layout, raw-data import, seeded in-memory state.
/// Nothing durable is written beyond the imported data until the first run.
pub async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<Json<CreateProjectResponse>> {
    if request.name.is_empty() || request.name.contains('/') {
        return Err(CoreError::Validation {
            field: "name".to_string(),
            reason: "project name must be a single non-empty path component".to_string(),
        }
        .into());
    }

    let base = request
        .base
        .clone()
        .unwrap_or_else(|| state.config.local.default_project_base.clone());
    let root = Path::new(&base).join(&request.name);

    let detected = probe(&request.mdocs_glob, state.config.local.dose_per_tilt_factor);

    create_layout(&root, &state.qsub_template(), &state.config.slurm_defaults)?;

    let prefix = format!("{}_", request.name);
    if let Err(e) = import_data(&root, &request.movies_glob, &request.mdocs_glob, &prefix) {
        // The layout was freshly created; do not leave a husk behind.
        if let Err(cleanup) = std::fs::remove_dir_all(&root) {
            warn!("could not clean up failed project {}: {cleanup}", root.display());
        }
        return Err(e.into());
    }

    let handle = state.registry.handle_for(&root).await;
    handle
        .store
        .create_project(
            &request.name,
            &root,
            &request.movies_glob,
            &request.mdocs_glob,
            &request.selected_jobs,
            &detected,
        )
        .await?;
    handle.ensure_watching().await;

    info!(project = request.name, "project created at {}", root.display());
    Ok(Json(CreateProjectResponse {
        project_path: root.display().to_string(),
    }))
}

/// Load an existing project from its snapshot and start watching it.
pub async fn open_project(
    State(state): State<AppState>,
    Json(request): Json<ProjectPathRequest>,
) -> ApiResult<Json<Project>> {
    let root = PathBuf::from(&request.path);
    let handle = state.registry.handle_for(&root).await;
    let project = handle.store.open_project(&root).await?;
    handle.ensure_watching().await;
    Ok(Json(project))
}

/// Current in-memory snapshot.
pub async fn get_state(
    State(state): State<AppState>,
    Query(query): Query<ProjectPathQuery>,
) -> ApiResult<Json<Project>> {
    let handle = loaded_handle(&state, Path::new(&query.path)).await?;
    Ok(Json(handle.store.snapshot().await?))
}

pub async fn set_global(
    State(state): State<AppState>,
    Json(request): Json<SetGlobalRequest>,
) -> ApiResult<Json<Project>> {
    let handle = loaded_handle(&state, Path::new(&request.path)).await?;
    let (group, field) = parse_field_ref(&request.field)?;
    let project = handle.store.set_global(group, field, &request.value).await?;
    Ok(Json(project))
}

pub async fn set_job_field(
    State(state): State<AppState>,
    Json(request): Json<SetJobFieldRequest>,
) -> ApiResult<Json<Project>> {
    let handle = loaded_handle(&state, Path::new(&request.path)).await?;
    let project = handle
        .store
        .set_job_field(request.kind, &request.field, &request.value)
        .await?;
    Ok(Json(project))
}

pub async fn select_job(
    State(state): State<AppState>,
    Json(request): Json<SelectJobRequest>,
) -> ApiResult<Json<Project>> {
    let handle = loaded_handle(&state, Path::new(&request.path)).await?;
    let project = handle
        .store
        .select_job(request.kind, request.position)
        .await?;
    Ok(Json(project))
}

pub async fn deselect_job(
    State(state): State<AppState>,
    Json(request): Json<SelectJobRequest>,
) -> ApiResult<Json<Project>> {
    let handle = loaded_handle(&state, Path::new(&request.path)).await?;
    let project = handle.store.deselect_job(request.kind).await?;
    Ok(Json(project))
}

/// Re-seed all records from defaults and re-run the metadata probe.
pub async fn reset_defaults(
    State(state): State<AppState>,
    Json(request): Json<ProjectPathRequest>,
) -> ApiResult<Json<Project>> {
    let handle = loaded_handle(&state, Path::new(&request.path)).await?;
    let current = handle.store.snapshot().await?;
    let detected = probe(&current.mdocs_glob, state.config.local.dose_per_tilt_factor);
    let project = handle.store.reset_to_defaults(&detected).await?;
    Ok(Json(project))
}

/// Run: snapshot to disk, materialize the scheme, spawn the pipeliner.
/// Ordering is the contract: the snapshot completes before the scheme is
/// written, and the scheme is fully on disk before the spawn.
pub async fn start_pipeline(
    State(state): State<AppState>,
    Json(request): Json<ProjectPathRequest>,
) -> ApiResult<Json<StartPipelineResponse>> {
    let root = PathBuf::from(&request.path);
    let handle = loaded_handle(&state, &root).await?;

    handle.store.snapshot_to_disk().await?;
    let project = handle.store.snapshot().await?;
    let scheme_name = scheme_name_for(&project);

    materialize_scheme(
        &state.config,
        &project,
        &state.scheme_templates_dir(),
        &scheme_name,
    )?;

    let extra_binds = vec![
        glob_parent(&project.movies_glob),
        glob_parent(&project.mdocs_glob),
    ];
    let pid = handle
        .runner
        .start(Arc::clone(&handle.store), &root, &scheme_name, extra_binds)
        .await?;
    handle.ensure_watching().await;

    Ok(Json(StartPipelineResponse { pid }))
}

pub async fn abort_pipeline(
    State(state): State<AppState>,
    Json(request): Json<ProjectPathRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let root = PathBuf::from(&request.path);
    let handle = state
        .registry
        .existing(&root)
        .await
        .ok_or(CoreError::NotRunning)
        .map_err(ApiError::from)?;
    let project = handle.store.snapshot().await?;
    handle.runner.abort(&root, &scheme_name_for(&project)).await?;
    Ok(Json(serde_json::json!({})))
}

/// Rewind the scheme back to its initial WAIT node.
pub async fn reset_head(
    State(state): State<AppState>,
    Json(request): Json<ProjectPathRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let root = PathBuf::from(&request.path);
    let handle = loaded_handle(&state, &root).await?;
    let project = handle.store.snapshot().await?;
    handle.runner.reset(&root, &scheme_name_for(&project)).await?;
    Ok(Json(serde_json::json!({})))
}

/// Clear the pipeliner's lock directory after a crash.
pub async fn unlock_pipeline(
    State(state): State<AppState>,
    Json(request): Json<ProjectPathRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let root = PathBuf::from(&request.path);
    let handle = loaded_handle(&state, &root).await?;
    let project = handle.store.snapshot().await?;
    handle.runner.unlock(&root, &scheme_name_for(&project)).await?;
    Ok(Json(serde_json::json!({})))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The handle for a project, loading its snapshot on first touch so a
/// restarted server can serve any previously created project.
pub async fn loaded_handle(state: &AppState, root: &Path) -> ApiResult<Arc<ProjectHandle>> {
    let handle = state.registry.handle_for(root).await;
    if handle.store.snapshot().await.is_err() {
        if root.join(SNAPSHOT_FILE).exists() {
            handle.store.open_project(root).await?;
            handle.ensure_watching().await;
        } else {
            return Err(CoreError::NotFound {
                path: root.to_path_buf(),
            }
            .into());
        }
    }
    Ok(handle)
}

/// Split a `<group>.<field>` reference.
fn parse_field_ref(field_ref: &str) -> Result<(GlobalGroup, &str), ApiError> {
    let Some((group, field)) = field_ref.split_once('.') else {
        return Err(CoreError::Validation {
            field: field_ref.to_string(),
            reason: "expected <group>.<field>".to_string(),
        }
        .into());
    };
    let group = match group {
        "microscope" => GlobalGroup::Microscope,
        "acquisition" => GlobalGroup::Acquisition,
        "computing" => GlobalGroup::Computing,
        other => {
            return Err(CoreError::Validation {
                field: field_ref.to_string(),
                reason: format!("unknown parameter group '{other}'"),
            }
            .into());
        }
    };
    Ok((group, field))
}
