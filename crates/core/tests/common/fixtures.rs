//! Test fixtures: configurations, acquisition data and project trees.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cb_core::config::models::{
    AppConfig, ContainerConfig, LocalConfig, SlurmDefaults, ToolConfig,
};
use cb_core::mdoc::DetectedParams;
use cb_core::state::StateStore;
use cb_protocol::JobKind;
use tempfile::TempDir;

/// Serializes tests that shadow binaries via PATH.
pub static PATH_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// The repository's shipped templates, used directly by the tests.
pub fn shipped_templates_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../templates")
        .join("schemes")
        .join("warp_tomo_prep")
}

pub fn shipped_qsub_template() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../templates")
        .join("qsub")
        .join("qsub.sh")
}

/// A config with warptools containerized (image created inside `dir`) and
/// everything else running as host binaries.
pub fn test_config(dir: &Path) -> AppConfig {
    let image = dir.join("warp.sif");
    std::fs::write(&image, b"sif").expect("failed to write image stub");

    let mut tools = BTreeMap::new();
    tools.insert(
        "warptools".to_string(),
        ToolConfig {
            binary: false,
            container: true,
            path: image.display().to_string(),
        },
    );
    tools.insert(
        "relion".to_string(),
        ToolConfig {
            binary: true,
            container: false,
            path: "relion".to_string(),
        },
    );

    AppConfig {
        local: LocalConfig {
            default_project_base: dir.join("projects").display().to_string(),
            default_movies_glob: None,
            default_mdocs_glob: None,
            dose_per_tilt_factor: 1.5,
        },
        slurm_defaults: SlurmDefaults {
            partition: "g".to_string(),
            gres: "gpu:2".to_string(),
            mem: "64G".to_string(),
            cpus_per_task: 8,
            ..Default::default()
        },
        tools,
        container: ContainerConfig::default(),
        microscopes: BTreeMap::new(),
        aliases: Vec::new(),
    }
}

const MDOC: &str = "PixelSpacing = 1.35\nVoltage = 300\nImageSize = 5760 4092\n\n[ZValue = 0]\nTiltAngle = 0.0\nExposureDose = 2.1\nSubFramePath = X:\\frames\\Position_1_001_EER.eer\n";

/// A raw acquisition directory with one tilt series.
pub fn write_acquisition_data(data_dir: &Path) {
    std::fs::create_dir_all(data_dir).expect("failed to create data dir");
    std::fs::write(data_dir.join("Position_1.mdoc"), MDOC).expect("failed to write mdoc");
    std::fs::write(data_dir.join("Position_1_001_EER.eer"), b"frames")
        .expect("failed to write movie");
}

pub const DEMO_SELECTION: [JobKind; 3] = [
    JobKind::ImportMovies,
    JobKind::FsMotionAndCtf,
    JobKind::TsAlignment,
];

/// A complete demo project on disk: layout, imported data, seeded store.
///
/// Returns the temp dir (keep alive), the project root, and the store.
pub async fn demo_project() -> (TempDir, PathBuf, StateStore) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let data = dir.path().join("data");
    write_acquisition_data(&data);

    let root = dir.path().join("projects").join("demo");
    cb_core::project::create_layout(&root, &shipped_qsub_template(), &SlurmDefaults::default())
        .expect("failed to create layout");

    let movies_glob = format!("{}/*.eer", data.display());
    let mdocs_glob = format!("{}/*.mdoc", data.display());
    cb_core::project::import_data(&root, &movies_glob, &mdocs_glob, "demo_")
        .expect("failed to import data");

    let detected = DetectedParams {
        pixel_spacing: Some(1.35),
        voltage: Some(300.0),
        dose_per_tilt: Some(3.15),
        tilt_axis_angle: Some(-95.0),
        ..Default::default()
    };
    let store = StateStore::new();
    store
        .create_project(
            "demo",
            &root,
            &movies_glob,
            &mdocs_glob,
            &DEMO_SELECTION,
            &detected,
        )
        .await
        .expect("failed to create project state");

    (dir, root, store)
}

/// Write a processes file listing the demo selection with given labels.
pub fn write_processes_file(project_root: &Path, statuses: &[(&str, &str)]) {
    let mut body = String::from(
        "# version 50001\n\ndata_pipeline_general\n\n_rlnPipeLineJobCounter    4\n\ndata_pipeline_processes\n\nloop_\n_rlnPipeLineProcessName #1\n_rlnPipeLineProcessAlias #2\n_rlnPipeLineProcessTypeLabel #3\n_rlnPipeLineProcessStatusLabel #4\n",
    );
    for (i, (kind, label)) in statuses.iter().enumerate() {
        body.push_str(&format!(
            "External/job{:03}/    Schemes/scheme_demo/{kind}    relion.external    {label}\n",
            i + 1
        ));
    }
    std::fs::write(project_root.join("default_pipeline.star"), body)
        .expect("failed to write processes file");
}
