//! Configuration models for the process-wide YAML document.
//!
//! The document describes local paths, cluster defaults, tool dispatch
//! rules, container runtime settings, microscope presets and UI aliases.
//!
//! ```yaml
//! local:
//!   default_project_base: /groups/cryo/projects
//!   default_movies_glob: "/data/*/frames/*.eer"
//!   default_mdocs_glob: "/data/*/mdoc/*.mdoc"
//!   dose_per_tilt_factor: 1.5
//! slurm_defaults:
//!   partition: g
//!   gres: "gpu:1"
//! tools:
//!   warptools: { container: true, path: /img/warp.sif }
//!   relion:    { container: true, path: /img/relion.sif }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `local` block: where projects live and data-glob conveniences.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LocalConfig {
    /// Directory under which new projects are created.
    pub default_project_base: String,

    /// Convenience defaults offered by the UI; never required.
    #[serde(default)]
    pub default_movies_glob: Option<String>,
    #[serde(default)]
    pub default_mdocs_glob: Option<String>,

    /// Multiplier applied to the per-frame exposure dose when deriving
    /// dose-per-tilt from acquisition metadata. Calibration data, not a
    /// constant.
    #[serde(default = "default_dose_factor")]
    pub dose_per_tilt_factor: f64,
}

fn default_dose_factor() -> f64 {
    1.5
}

/// `slurm_defaults` block: cluster defaults for templated qsub scripts.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SlurmDefaults {
    pub partition: String,
    #[serde(default)]
    pub constraint: String,
    #[serde(default = "default_one")]
    pub nodes: u32,
    #[serde(default = "default_one")]
    pub ntasks_per_node: u32,
    #[serde(default = "default_cpus")]
    pub cpus_per_task: u32,
    #[serde(default = "default_gres")]
    pub gres: String,
    #[serde(default = "default_mem")]
    pub mem: String,
    #[serde(default = "default_time")]
    pub time: String,
}

fn default_one() -> u32 {
    1
}
fn default_cpus() -> u32 {
    4
}
fn default_gres() -> String {
    "gpu:1".to_string()
}
fn default_mem() -> String {
    "32G".to_string()
}
fn default_time() -> String {
    "2:00:00".to_string()
}

impl Default for SlurmDefaults {
    fn default() -> Self {
        Self {
            partition: "g".to_string(),
            constraint: String::new(),
            nodes: 1,
            ntasks_per_node: 1,
            cpus_per_task: 4,
            gres: default_gres(),
            mem: default_mem(),
            time: default_time(),
        }
    }
}

impl SlurmDefaults {
    /// GPU count parsed from the GRES string (`gpu:2` or `gpu:a100:2`).
    pub fn gpu_count(&self) -> u32 {
        self.gres
            .rsplit(':')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

/// How one tool is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolExecution {
    /// Invoke a binary on the host.
    Binary,
    /// Run inside a container image.
    Container,
}

/// `tools.<name>` entry: exactly one of `binary`/`container` must be set,
/// and `path` points at whichever applies.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ToolConfig {
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub container: bool,
    pub path: String,
}

impl ToolConfig {
    /// The declared execution mode, if unambiguous.
    pub fn execution(&self) -> Option<ToolExecution> {
        match (self.binary, self.container) {
            (true, false) => Some(ToolExecution::Binary),
            (false, true) => Some(ToolExecution::Container),
            _ => None,
        }
    }
}

/// `container` block: runtime settings shared by all containerized tools.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContainerConfig {
    /// Container runtime executable.
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// PATH injected inside the RELION image; the image's conda
    /// environment plus the host scheduler client directory.
    #[serde(default = "default_relion_path")]
    pub relion_path_env: String,

    /// Host cluster-integration paths, bound into containers only when
    /// they exist on this node.
    #[serde(default = "default_scheduler_bin")]
    pub scheduler_bin_dir: String,
    #[serde(default = "default_scheduler_lib")]
    pub scheduler_lib_dir: String,
    #[serde(default = "default_munge_dir")]
    pub munge_socket_dir: String,
}

fn default_runtime() -> String {
    "apptainer".to_string()
}

fn default_scheduler_bin() -> String {
    "/opt/slurm/bin".to_string()
}

fn default_scheduler_lib() -> String {
    "/usr/lib64/slurm".to_string()
}

fn default_munge_dir() -> String {
    "/run/munge".to_string()
}

fn default_relion_path() -> String {
    "/opt/miniconda3/envs/relion-5.0/bin:/opt/miniconda3/bin:/opt/relion-5.0/build/bin:/usr/local/cuda/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            relion_path_env: default_relion_path(),
            scheduler_bin_dir: default_scheduler_bin(),
            scheduler_lib_dir: default_scheduler_lib(),
            munge_socket_dir: default_munge_dir(),
        }
    }
}

/// `microscopes.<preset>` entry: named default microscope parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MicroscopePreset {
    pub pixel_size_angstrom: f64,
    pub acceleration_voltage_kv: f64,
    #[serde(default = "default_cs")]
    pub spherical_aberration_mm: f64,
    #[serde(default = "default_q0")]
    pub amplitude_contrast: f64,
}

fn default_cs() -> f64 {
    2.7
}
fn default_q0() -> f64 {
    0.1
}

/// The root configuration document.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub local: LocalConfig,
    #[serde(default)]
    pub slurm_defaults: SlurmDefaults,
    pub tools: BTreeMap<String, ToolConfig>,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub microscopes: BTreeMap<String, MicroscopePreset>,
    /// Pairs mapping the scheme-file parameter name to the UI label.
    #[serde(default)]
    pub aliases: Vec<(String, String)>,
}

impl AppConfig {
    /// Look up a tool's configuration by its tool tag.
    pub fn tool(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.get(name)
    }
}
