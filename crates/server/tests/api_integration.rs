//! HTTP surface integration tests: real router, temp project trees,
//! no network.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use cb_core::config::models::{AppConfig, ContainerConfig, LocalConfig, SlurmDefaults};
use cb_core::scheduler::SlurmClient;
use cb_server::{create_routes, AppState, ProjectRegistry};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn test_state(dir: &TempDir) -> AppState {
    let config = Arc::new(AppConfig {
        local: LocalConfig {
            default_project_base: dir.path().join("projects").display().to_string(),
            default_movies_glob: None,
            default_mdocs_glob: None,
            dose_per_tilt_factor: 1.5,
        },
        slurm_defaults: SlurmDefaults::default(),
        tools: BTreeMap::new(),
        container: ContainerConfig::default(),
        microscopes: BTreeMap::new(),
        aliases: vec![("angpix".to_string(), "Pixel size".to_string())],
    });
    let registry = Arc::new(ProjectRegistry::new(
        Arc::clone(&config),
        Arc::new(SlurmClient::new()),
    ));
    AppState {
        config,
        registry,
        server_root: repo_root(),
    }
}

fn write_acquisition_data(data_dir: &Path) {
    std::fs::create_dir_all(data_dir).unwrap();
    std::fs::write(
        data_dir.join("Position_1.mdoc"),
        "PixelSpacing = 1.35\nVoltage = 300\nImageSize = 5760 4092\n\n[ZValue = 0]\nTiltAngle = 0.0\nExposureDose = 2.1\nSubFramePath = X:\\frames\\Position_1_001_EER.eer\n",
    )
    .unwrap();
    std::fs::write(data_dir.join("Position_1_001_EER.eer"), b"frames").unwrap();
}

async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn create_request_body(dir: &TempDir) -> Value {
    let data = dir.path().join("data");
    json!({
        "name": "demo",
        "movies_glob": format!("{}/*.eer", data.display()),
        "mdocs_glob": format!("{}/*.mdoc", data.display()),
        "selected_jobs": ["import_movies", "fs_motion_and_ctf", "ts_alignment"]
    })
}

#[tokio::test]
async fn test_create_project_and_fetch_state() {
    let dir = tempfile::tempdir().unwrap();
    write_acquisition_data(&dir.path().join("data"));
    let router = create_routes(test_state(&dir));

    let (status, body) = post_json(&router, "/api/projects", create_request_body(&dir)).await;
    assert_eq!(status, StatusCode::OK, "create failed: {body}");
    let project_path = body["project_path"].as_str().unwrap().to_string();
    assert!(Path::new(&project_path).join("frames").is_dir());
    assert!(Path::new(&project_path).join("qsub/qsub.sh").is_file());

    let response = router
        .clone()
        .oneshot(
            Request::get(format!("/api/projects/state?path={project_path}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let state: Value = serde_json::from_slice(&bytes).unwrap();

    // The probe seeded the globals from the acquisition metadata.
    assert_eq!(state["microscope"]["pixel_size_angstrom"], 1.35);
    assert_eq!(state["acquisition"]["dose_per_tilt"], 3.15);
    assert_eq!(state["selected_jobs"][2], "ts_alignment");
}

#[tokio::test]
async fn test_create_duplicate_project_is_conflict() {
    let dir = tempfile::tempdir().unwrap();
    write_acquisition_data(&dir.path().join("data"));
    let router = create_routes(test_state(&dir));

    let (status, _) = post_json(&router, "/api/projects", create_request_body(&dir)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_json(&router, "/api/projects", create_request_body(&dir)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "exists");
}

#[tokio::test]
async fn test_set_global_validation_and_success() {
    let dir = tempfile::tempdir().unwrap();
    write_acquisition_data(&dir.path().join("data"));
    let router = create_routes(test_state(&dir));

    let (_, body) = post_json(&router, "/api/projects", create_request_body(&dir)).await;
    let path = body["project_path"].as_str().unwrap().to_string();

    // Out of range: rejected with a stable kind.
    let (status, body) = post_json(
        &router,
        "/api/projects/global",
        json!({"path": path, "field": "microscope.pixel_size_angstrom", "value": 0.4}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");

    // In range: new snapshot returned.
    let (status, body) = post_json(
        &router,
        "/api/projects/global",
        json!({"path": path, "field": "microscope.pixel_size_angstrom", "value": 1.4}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["microscope"]["pixel_size_angstrom"], 1.4);
}

#[tokio::test]
async fn test_set_job_field_and_selection() {
    let dir = tempfile::tempdir().unwrap();
    write_acquisition_data(&dir.path().join("data"));
    let router = create_routes(test_state(&dir));

    let (_, body) = post_json(&router, "/api/projects", create_request_body(&dir)).await;
    let path = body["project_path"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        &router,
        "/api/projects/job-field",
        json!({"path": path, "kind": "ts_alignment", "field": "thickness_nm", "value": 300.0}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["jobs"]["ts_alignment"]["params"]["thickness_nm"],
        300.0
    );

    // Selecting an already-selected kind is rejected.
    let (status, body) = post_json(
        &router,
        "/api/projects/select-job",
        json!({"path": path, "kind": "ts_alignment"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation_error");

    let (status, body) = post_json(
        &router,
        "/api/projects/select-job",
        json!({"path": path, "kind": "ts_ctf"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["selected_jobs"][3], "ts_ctf");
}

#[tokio::test]
async fn test_abort_without_run_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_acquisition_data(&dir.path().join("data"));
    let router = create_routes(test_state(&dir));

    let (_, body) = post_json(&router, "/api/projects", create_request_body(&dir)).await;
    let path = body["project_path"].as_str().unwrap().to_string();

    let (status, body) = post_json(&router, "/api/pipeline/abort", json!({"path": path})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "not_running");
}

#[tokio::test]
async fn test_open_missing_project_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_routes(test_state(&dir));

    let (status, body) = post_json(
        &router,
        "/api/projects/open",
        json!({"path": dir.path().join("projects/ghost").display().to_string()}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_server_config_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let router = create_routes(test_state(&dir));

    let response = router
        .clone()
        .oneshot(Request::get("/api/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["aliases"][0][0], "angpix");
    assert!(body["default_project_base"].as_str().unwrap().contains("projects"));
}
