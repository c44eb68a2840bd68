//! Job identity and per-job parameter models.
//!
//! A [`JobKind`] is the closed, ordered identity of a pipeline step. Each
//! kind carries two compile-time properties: the tool it invokes
//! ([`ToolTag`]) and whether its command is assembled directly or delegated
//! to a driver bootstrap ([`JobKind::is_driver`]).
//!
//! A [`JobRecord`] holds only job-specific knobs plus an execution status.
//! Parameters shared across jobs (microscope, acquisition, computing) live
//! in the global records and are referenced at command-build time, never
//! copied here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use ts_rs::TS;

/// Identity of a pipeline step.
///
/// The enumeration order is the canonical pipeline order; a project's
/// selected-jobs list must be consistent with it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TS)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ImportMovies,
    FsMotionAndCtf,
    TsAlignment,
    TsCtf,
    TsReconstruct,
    DenoiseTrain,
    DenoisePredict,
    TemplateMatching,
    ExtractCandidates,
    SubtomoExtraction,
}

/// Which external tool a job invokes. Bridges job kinds to container
/// image selection in the process configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
pub enum ToolTag {
    Relion,
    Warptools,
    Cryocare,
    Pytom,
}

impl ToolTag {
    /// The tool name as it appears in the `tools` configuration block.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolTag::Relion => "relion",
            ToolTag::Warptools => "warptools",
            ToolTag::Cryocare => "cryocare",
            ToolTag::Pytom => "pytom",
        }
    }
}

impl JobKind {
    /// All kinds in canonical pipeline order.
    pub const ALL: [JobKind; 10] = [
        JobKind::ImportMovies,
        JobKind::FsMotionAndCtf,
        JobKind::TsAlignment,
        JobKind::TsCtf,
        JobKind::TsReconstruct,
        JobKind::DenoiseTrain,
        JobKind::DenoisePredict,
        JobKind::TemplateMatching,
        JobKind::ExtractCandidates,
        JobKind::SubtomoExtraction,
    ];

    /// The wire name, also used as the scheme subdirectory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ImportMovies => "import_movies",
            JobKind::FsMotionAndCtf => "fs_motion_and_ctf",
            JobKind::TsAlignment => "ts_alignment",
            JobKind::TsCtf => "ts_ctf",
            JobKind::TsReconstruct => "ts_reconstruct",
            JobKind::DenoiseTrain => "denoise_train",
            JobKind::DenoisePredict => "denoise_predict",
            JobKind::TemplateMatching => "template_matching",
            JobKind::ExtractCandidates => "extract_candidates",
            JobKind::SubtomoExtraction => "subtomo_extraction",
        }
    }

    /// Parse a wire name back into a kind.
    pub fn parse(s: &str) -> Option<JobKind> {
        JobKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// The tool this kind invokes.
    pub fn tool_tag(&self) -> ToolTag {
        match self {
            JobKind::ImportMovies => ToolTag::Relion,
            JobKind::FsMotionAndCtf
            | JobKind::TsAlignment
            | JobKind::TsCtf
            | JobKind::TsReconstruct => ToolTag::Warptools,
            JobKind::DenoiseTrain | JobKind::DenoisePredict => ToolTag::Cryocare,
            JobKind::TemplateMatching | JobKind::ExtractCandidates => ToolTag::Pytom,
            JobKind::SubtomoExtraction => ToolTag::Relion,
        }
    }

    /// Whether the command is a driver bootstrap rather than a directly
    /// assembled tool invocation.
    pub fn is_driver(&self) -> bool {
        !matches!(self, JobKind::ImportMovies)
    }

    /// Position in the canonical order.
    pub fn ordinal(&self) -> usize {
        JobKind::ALL.iter().position(|k| k == self).unwrap_or(0)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived execution status of a job within a project.
///
/// Computed by joining the selected-jobs list against the pipeliner's
/// processes file. Jobs absent from the file are `Scheduled` when selected,
/// `NotScheduled` otherwise.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    NotScheduled,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    /// Map a processes-file status label to a derived status.
    ///
    /// The pipeliner writes `Scheduled`, `Running`, `Succeeded`, `Failed`,
    /// `Aborted`; older versions also emit `Pending`, which maps to
    /// [`JobStatus::Scheduled`]. Unknown labels yield `None`.
    pub fn from_process_label(label: &str) -> Option<JobStatus> {
        match label {
            "Scheduled" | "Pending" => Some(JobStatus::Scheduled),
            "Running" => Some(JobStatus::Running),
            "Succeeded" => Some(JobStatus::Succeeded),
            "Failed" => Some(JobStatus::Failed),
            "Aborted" => Some(JobStatus::Aborted),
            _ => None,
        }
    }

    /// Whether a record in this status accepts parameter mutations.
    pub fn is_mutable(&self) -> bool {
        matches!(self, JobStatus::NotScheduled | JobStatus::Scheduled)
    }
}

/// Error returned by dynamic field updates on job parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("unknown field '{0}'")]
    Unknown(String),
    #[error("invalid value for field '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> FieldError {
    FieldError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn as_f64(field: &str, value: &Value) -> Result<f64, FieldError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(field, "not a number")),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| invalid(field, "not a number")),
        _ => Err(invalid(field, "expected a number")),
    }
}

fn as_i64(field: &str, value: &Value) -> Result<i64, FieldError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| invalid(field, "not an integer")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| invalid(field, "not an integer")),
        _ => Err(invalid(field, "expected an integer")),
    }
}

fn as_bool(field: &str, value: &Value) -> Result<bool, FieldError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.as_str() {
            "true" | "Yes" | "yes" | "1" => Ok(true),
            "false" | "No" | "no" | "0" => Ok(false),
            _ => Err(invalid(field, "expected a boolean")),
        },
        _ => Err(invalid(field, "expected a boolean")),
    }
}

fn as_string(field: &str, value: &Value) -> Result<String, FieldError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(invalid(field, "expected a string")),
    }
}

fn in_range_f64(field: &str, v: f64, lo: f64, hi: f64) -> Result<f64, FieldError> {
    if v < lo || v > hi {
        Err(invalid(field, format!("must be within [{lo}, {hi}]")))
    } else {
        Ok(v)
    }
}

fn in_range_i64(field: &str, v: i64, lo: i64, hi: i64) -> Result<i64, FieldError> {
    if v < lo || v > hi {
        Err(invalid(field, format!("must be within [{lo}, {hi}]")))
    } else {
        Ok(v)
    }
}

/// Tilt-series alignment backend.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
pub enum AlignmentMethod {
    AreTomo,
    #[serde(rename = "IMOD")]
    Imod,
    Relion,
}

/// Movie import (RELION native tomography import).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ImportMoviesParams {
    pub optics_group_name: String,
    pub do_at_most: i64,
}

impl Default for ImportMoviesParams {
    fn default() -> Self {
        Self {
            optics_group_name: "opticsGroup1".to_string(),
            do_at_most: -1,
        }
    }
}

impl ImportMoviesParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "optics_group_name" => self.optics_group_name = as_string(field, value)?,
            "do_at_most" => self.do_at_most = as_i64(field, value)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Frame-series motion correction and CTF estimation (WarpTools).
///
/// Range fields use the `min:max` string convention the tool expects.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct FsMotionAndCtfParams {
    pub m_range_min_max: String,
    pub m_bfac: i64,
    pub m_grid: String,
    pub c_range_min_max: String,
    pub c_defocus_min_max: String,
    pub c_grid: String,
    pub c_window: i64,
    pub c_use_sum: bool,
    pub out_average_halves: bool,
    pub out_skip_first: i64,
    pub out_skip_last: i64,
    pub perdevice: i64,
    pub do_at_most: i64,
    pub gain_operations: Option<String>,
}

impl Default for FsMotionAndCtfParams {
    fn default() -> Self {
        Self {
            m_range_min_max: "500:10".to_string(),
            m_bfac: -500,
            m_grid: "1x1x3".to_string(),
            c_range_min_max: "30:6.0".to_string(),
            c_defocus_min_max: "1.1:8".to_string(),
            c_grid: "2x2x1".to_string(),
            c_window: 512,
            c_use_sum: false,
            out_average_halves: true,
            out_skip_first: 0,
            out_skip_last: 0,
            perdevice: 1,
            do_at_most: -1,
            gain_operations: None,
        }
    }
}

impl FsMotionAndCtfParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "m_range_min_max" => self.m_range_min_max = as_string(field, value)?,
            "m_bfac" => self.m_bfac = as_i64(field, value)?,
            "m_grid" => self.m_grid = as_string(field, value)?,
            "c_range_min_max" => self.c_range_min_max = as_string(field, value)?,
            "c_defocus_min_max" => self.c_defocus_min_max = as_string(field, value)?,
            "c_grid" => self.c_grid = as_string(field, value)?,
            "c_window" => self.c_window = in_range_i64(field, as_i64(field, value)?, 128, 4096)?,
            "c_use_sum" => self.c_use_sum = as_bool(field, value)?,
            "out_average_halves" => self.out_average_halves = as_bool(field, value)?,
            "out_skip_first" => self.out_skip_first = as_i64(field, value)?,
            "out_skip_last" => self.out_skip_last = as_i64(field, value)?,
            "perdevice" => self.perdevice = in_range_i64(field, as_i64(field, value)?, 0, 8)?,
            "do_at_most" => self.do_at_most = as_i64(field, value)?,
            "gain_operations" => {
                self.gain_operations = match value {
                    Value::Null => None,
                    other => Some(as_string(field, other)?),
                }
            }
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Tilt-series alignment (AreTomo / IMOD / RELION via WarpTools).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct TsAlignmentParams {
    pub alignment_method: AlignmentMethod,
    pub rescale_angpixs: f64,
    pub tomo_dimensions: String,
    pub thickness_nm: f64,
    pub do_at_most: i64,
    pub perdevice: i64,
    pub mdoc_pattern: String,
    pub gain_operations: Option<String>,
    pub patch_x: i64,
    pub patch_y: i64,
    pub axis_iter: i64,
    pub axis_batch: i64,
    pub imod_patch_size: i64,
    pub imod_overlap: i64,
}

impl Default for TsAlignmentParams {
    fn default() -> Self {
        Self {
            alignment_method: AlignmentMethod::AreTomo,
            rescale_angpixs: 12.0,
            tomo_dimensions: "4096x4096x2048".to_string(),
            thickness_nm: 200.0,
            do_at_most: -1,
            perdevice: 1,
            mdoc_pattern: "*.mdoc".to_string(),
            gain_operations: None,
            patch_x: 2,
            patch_y: 2,
            axis_iter: 1,
            axis_batch: 5,
            imod_patch_size: 200,
            imod_overlap: 50,
        }
    }
}

impl TsAlignmentParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "alignment_method" => {
                let s = as_string(field, value)?;
                self.alignment_method = match s.as_str() {
                    "AreTomo" => AlignmentMethod::AreTomo,
                    "IMOD" => AlignmentMethod::Imod,
                    "Relion" => AlignmentMethod::Relion,
                    _ => return Err(invalid(field, "expected AreTomo, IMOD or Relion")),
                };
            }
            "rescale_angpixs" => {
                self.rescale_angpixs = in_range_f64(field, as_f64(field, value)?, 2.0, 50.0)?
            }
            "tomo_dimensions" => self.tomo_dimensions = as_string(field, value)?,
            "thickness_nm" => {
                self.thickness_nm = in_range_f64(field, as_f64(field, value)?, 50.0, 1000.0)?
            }
            "do_at_most" => self.do_at_most = as_i64(field, value)?,
            "perdevice" => self.perdevice = in_range_i64(field, as_i64(field, value)?, 0, 8)?,
            "mdoc_pattern" => self.mdoc_pattern = as_string(field, value)?,
            "gain_operations" => {
                self.gain_operations = match value {
                    Value::Null => None,
                    other => Some(as_string(field, other)?),
                }
            }
            "patch_x" => self.patch_x = in_range_i64(field, as_i64(field, value)?, 0, 16)?,
            "patch_y" => self.patch_y = in_range_i64(field, as_i64(field, value)?, 0, 16)?,
            "axis_iter" => self.axis_iter = in_range_i64(field, as_i64(field, value)?, 0, 10)?,
            "axis_batch" => self.axis_batch = in_range_i64(field, as_i64(field, value)?, 1, 50)?,
            "imod_patch_size" => self.imod_patch_size = as_i64(field, value)?,
            "imod_overlap" => self.imod_overlap = as_i64(field, value)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Tilt-series CTF estimation (WarpTools).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct TsCtfParams {
    pub window: i64,
    pub range_min_max: String,
    pub defocus_min_max: String,
    pub defocus_hand: String,
    pub perdevice: i64,
}

impl Default for TsCtfParams {
    fn default() -> Self {
        Self {
            window: 512,
            range_min_max: "30:6.0".to_string(),
            defocus_min_max: "0.5:8".to_string(),
            defocus_hand: "set_flip".to_string(),
            perdevice: 1,
        }
    }
}

impl TsCtfParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "window" => self.window = in_range_i64(field, as_i64(field, value)?, 128, 2048)?,
            "range_min_max" => self.range_min_max = as_string(field, value)?,
            "defocus_min_max" => self.defocus_min_max = as_string(field, value)?,
            "defocus_hand" => self.defocus_hand = as_string(field, value)?,
            "perdevice" => self.perdevice = in_range_i64(field, as_i64(field, value)?, 0, 8)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Tomogram reconstruction (WarpTools).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct TsReconstructParams {
    pub rescale_angpixs: f64,
    pub halfmap_frames: i64,
    pub deconv: i64,
    pub perdevice: i64,
}

impl Default for TsReconstructParams {
    fn default() -> Self {
        Self {
            rescale_angpixs: 12.0,
            halfmap_frames: 1,
            deconv: 1,
            perdevice: 1,
        }
    }
}

impl TsReconstructParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "rescale_angpixs" => {
                self.rescale_angpixs = in_range_f64(field, as_f64(field, value)?, 2.0, 50.0)?
            }
            "halfmap_frames" => {
                self.halfmap_frames = in_range_i64(field, as_i64(field, value)?, 0, 1)?
            }
            "deconv" => self.deconv = in_range_i64(field, as_i64(field, value)?, 0, 1)?,
            "perdevice" => self.perdevice = in_range_i64(field, as_i64(field, value)?, 0, 8)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Denoiser training (cryoCARE).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct DenoiseTrainParams {
    pub tomograms_for_training: String,
    pub number_training_subvolumes: i64,
    pub subvolume_dimensions: i64,
    pub perdevice: i64,
}

impl Default for DenoiseTrainParams {
    fn default() -> Self {
        Self {
            tomograms_for_training: "Position_1".to_string(),
            number_training_subvolumes: 600,
            subvolume_dimensions: 64,
            perdevice: 1,
        }
    }
}

impl DenoiseTrainParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "tomograms_for_training" => self.tomograms_for_training = as_string(field, value)?,
            "number_training_subvolumes" => {
                let v = as_i64(field, value)?;
                if v < 100 {
                    return Err(invalid(field, "must be at least 100"));
                }
                self.number_training_subvolumes = v;
            }
            "subvolume_dimensions" => {
                let v = as_i64(field, value)?;
                if v < 32 {
                    return Err(invalid(field, "must be at least 32"));
                }
                self.subvolume_dimensions = v;
            }
            "perdevice" => self.perdevice = in_range_i64(field, as_i64(field, value)?, 0, 8)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Denoiser inference (cryoCARE).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct DenoisePredictParams {
    pub ntiles_x: i64,
    pub ntiles_y: i64,
    pub ntiles_z: i64,
    pub denoising_tomo_name: String,
    pub perdevice: i64,
}

impl Default for DenoisePredictParams {
    fn default() -> Self {
        Self {
            ntiles_x: 4,
            ntiles_y: 4,
            ntiles_z: 4,
            denoising_tomo_name: String::new(),
            perdevice: 1,
        }
    }
}

impl DenoisePredictParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "ntiles_x" => self.ntiles_x = in_range_i64(field, as_i64(field, value)?, 1, 64)?,
            "ntiles_y" => self.ntiles_y = in_range_i64(field, as_i64(field, value)?, 1, 64)?,
            "ntiles_z" => self.ntiles_z = in_range_i64(field, as_i64(field, value)?, 1, 64)?,
            "denoising_tomo_name" => self.denoising_tomo_name = as_string(field, value)?,
            "perdevice" => self.perdevice = in_range_i64(field, as_i64(field, value)?, 0, 8)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Template matching (pyTOM).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct TemplateMatchingParams {
    pub template_path: String,
    pub mask_path: String,
    pub angular_search: String,
    pub symmetry: String,
    pub defocus_weight: bool,
    pub dose_weight: bool,
    pub spectral_whitening: bool,
    pub random_phase_correction: bool,
    pub non_spherical_mask: bool,
    pub bandpass_filter: String,
    pub gpu_split: String,
    pub perdevice: i64,
}

impl Default for TemplateMatchingParams {
    fn default() -> Self {
        Self {
            template_path: String::new(),
            mask_path: String::new(),
            angular_search: "12.0".to_string(),
            symmetry: "C1".to_string(),
            defocus_weight: true,
            dose_weight: true,
            spectral_whitening: true,
            random_phase_correction: false,
            non_spherical_mask: false,
            bandpass_filter: "None".to_string(),
            gpu_split: "auto".to_string(),
            perdevice: 1,
        }
    }
}

impl TemplateMatchingParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "template_path" => self.template_path = as_string(field, value)?,
            "mask_path" => self.mask_path = as_string(field, value)?,
            "angular_search" => self.angular_search = as_string(field, value)?,
            "symmetry" => self.symmetry = as_string(field, value)?,
            "defocus_weight" => self.defocus_weight = as_bool(field, value)?,
            "dose_weight" => self.dose_weight = as_bool(field, value)?,
            "spectral_whitening" => self.spectral_whitening = as_bool(field, value)?,
            "random_phase_correction" => self.random_phase_correction = as_bool(field, value)?,
            "non_spherical_mask" => self.non_spherical_mask = as_bool(field, value)?,
            "bandpass_filter" => self.bandpass_filter = as_string(field, value)?,
            "gpu_split" => self.gpu_split = as_string(field, value)?,
            "perdevice" => self.perdevice = in_range_i64(field, as_i64(field, value)?, 0, 8)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Candidate extraction from template-matching score maps (pyTOM).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ExtractCandidatesParams {
    pub particle_diameter_ang: f64,
    pub max_num_particles: i64,
    pub cutoff_method: String,
    pub cutoff_value: f64,
    pub apix_score_map: String,
    pub score_filter_method: String,
    pub score_filter_value: String,
    pub mask_fold_path: String,
}

impl Default for ExtractCandidatesParams {
    fn default() -> Self {
        Self {
            particle_diameter_ang: 200.0,
            max_num_particles: 1500,
            cutoff_method: "NumberOfFalsePositives".to_string(),
            cutoff_value: 1.0,
            apix_score_map: "auto".to_string(),
            score_filter_method: "None".to_string(),
            score_filter_value: "None".to_string(),
            mask_fold_path: "None".to_string(),
        }
    }
}

impl ExtractCandidatesParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "particle_diameter_ang" => {
                let v = as_f64(field, value)?;
                if v <= 0.0 {
                    return Err(invalid(field, "must be positive"));
                }
                self.particle_diameter_ang = v;
            }
            "max_num_particles" => {
                let v = as_i64(field, value)?;
                if v < 1 {
                    return Err(invalid(field, "must be at least 1"));
                }
                self.max_num_particles = v;
            }
            "cutoff_method" => self.cutoff_method = as_string(field, value)?,
            "cutoff_value" => self.cutoff_value = as_f64(field, value)?,
            "apix_score_map" => self.apix_score_map = as_string(field, value)?,
            "score_filter_method" => self.score_filter_method = as_string(field, value)?,
            "score_filter_value" => self.score_filter_value = as_string(field, value)?,
            "mask_fold_path" => self.mask_fold_path = as_string(field, value)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Pseudo-subtomogram extraction (RELION).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct SubtomoExtractionParams {
    pub binning: f64,
    pub box_size: i64,
    pub crop_size: i64,
    pub do_float16: bool,
    pub do_stack2d: bool,
    pub max_dose: f64,
    pub min_frames: i64,
}

impl Default for SubtomoExtractionParams {
    fn default() -> Self {
        Self {
            binning: 1.0,
            box_size: 512,
            crop_size: 256,
            do_float16: true,
            do_stack2d: true,
            max_dose: -1.0,
            min_frames: 1,
        }
    }
}

impl SubtomoExtractionParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "binning" => {
                let v = as_f64(field, value)?;
                if v < 1.0 {
                    return Err(invalid(field, "must be at least 1"));
                }
                self.binning = v;
            }
            "box_size" => self.box_size = in_range_i64(field, as_i64(field, value)?, 16, 4096)?,
            "crop_size" => self.crop_size = as_i64(field, value)?,
            "do_float16" => self.do_float16 = as_bool(field, value)?,
            "do_stack2d" => self.do_stack2d = as_bool(field, value)?,
            "max_dose" => self.max_dose = as_f64(field, value)?,
            "min_frames" => {
                let v = as_i64(field, value)?;
                if v < 1 {
                    return Err(invalid(field, "must be at least 1"));
                }
                self.min_frames = v;
            }
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Job-specific parameters, tagged by kind.
///
/// The tag makes the snapshot self-describing: a record read back from
/// `project_params.json` always knows which parameter set it carries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    ImportMovies(ImportMoviesParams),
    FsMotionAndCtf(FsMotionAndCtfParams),
    TsAlignment(TsAlignmentParams),
    TsCtf(TsCtfParams),
    TsReconstruct(TsReconstructParams),
    DenoiseTrain(DenoiseTrainParams),
    DenoisePredict(DenoisePredictParams),
    TemplateMatching(TemplateMatchingParams),
    ExtractCandidates(ExtractCandidatesParams),
    SubtomoExtraction(SubtomoExtractionParams),
}

impl JobParams {
    /// Kind-specific defaults.
    pub fn defaults_for(kind: JobKind) -> JobParams {
        match kind {
            JobKind::ImportMovies => JobParams::ImportMovies(Default::default()),
            JobKind::FsMotionAndCtf => JobParams::FsMotionAndCtf(Default::default()),
            JobKind::TsAlignment => JobParams::TsAlignment(Default::default()),
            JobKind::TsCtf => JobParams::TsCtf(Default::default()),
            JobKind::TsReconstruct => JobParams::TsReconstruct(Default::default()),
            JobKind::DenoiseTrain => JobParams::DenoiseTrain(Default::default()),
            JobKind::DenoisePredict => JobParams::DenoisePredict(Default::default()),
            JobKind::TemplateMatching => JobParams::TemplateMatching(Default::default()),
            JobKind::ExtractCandidates => JobParams::ExtractCandidates(Default::default()),
            JobKind::SubtomoExtraction => JobParams::SubtomoExtraction(Default::default()),
        }
    }

    /// The kind these parameters belong to.
    pub fn kind(&self) -> JobKind {
        match self {
            JobParams::ImportMovies(_) => JobKind::ImportMovies,
            JobParams::FsMotionAndCtf(_) => JobKind::FsMotionAndCtf,
            JobParams::TsAlignment(_) => JobKind::TsAlignment,
            JobParams::TsCtf(_) => JobKind::TsCtf,
            JobParams::TsReconstruct(_) => JobKind::TsReconstruct,
            JobParams::DenoiseTrain(_) => JobKind::DenoiseTrain,
            JobParams::DenoisePredict(_) => JobKind::DenoisePredict,
            JobParams::TemplateMatching(_) => JobKind::TemplateMatching,
            JobParams::ExtractCandidates(_) => JobKind::ExtractCandidates,
            JobParams::SubtomoExtraction(_) => JobKind::SubtomoExtraction,
        }
    }

    /// Set one field by name, parsing and validating the JSON value.
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match self {
            JobParams::ImportMovies(p) => p.set_field(field, value),
            JobParams::FsMotionAndCtf(p) => p.set_field(field, value),
            JobParams::TsAlignment(p) => p.set_field(field, value),
            JobParams::TsCtf(p) => p.set_field(field, value),
            JobParams::TsReconstruct(p) => p.set_field(field, value),
            JobParams::DenoiseTrain(p) => p.set_field(field, value),
            JobParams::DenoisePredict(p) => p.set_field(field, value),
            JobParams::TemplateMatching(p) => p.set_field(field, value),
            JobParams::ExtractCandidates(p) => p.set_field(field, value),
            JobParams::SubtomoExtraction(p) => p.set_field(field, value),
        }
    }
}

/// One selected job in a project: job-specific knobs plus execution status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct JobRecord {
    pub execution_status: JobStatus,
    pub params: JobParams,
}

impl JobRecord {
    /// A fresh record seeded from kind-specific defaults.
    pub fn with_defaults(kind: JobKind) -> JobRecord {
        JobRecord {
            execution_status: JobStatus::Scheduled,
            params: JobParams::defaults_for(kind),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.params.kind()
    }

    /// A record is frozen once it leaves the scheduled states.
    pub fn is_frozen(&self) -> bool {
        !self.execution_status.is_mutable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_kind_order_and_names() {
        assert_eq!(JobKind::ImportMovies.as_str(), "import_movies");
        assert_eq!(JobKind::parse("ts_alignment"), Some(JobKind::TsAlignment));
        assert_eq!(JobKind::parse("bogus"), None);
        assert!(JobKind::ImportMovies.ordinal() < JobKind::FsMotionAndCtf.ordinal());
        assert!(JobKind::TsCtf.ordinal() < JobKind::SubtomoExtraction.ordinal());
    }

    #[test]
    fn test_tool_tags_and_driver_flags() {
        assert_eq!(JobKind::ImportMovies.tool_tag(), ToolTag::Relion);
        assert!(!JobKind::ImportMovies.is_driver());
        assert_eq!(JobKind::FsMotionAndCtf.tool_tag(), ToolTag::Warptools);
        assert!(JobKind::FsMotionAndCtf.is_driver());
        assert_eq!(JobKind::TemplateMatching.tool_tag(), ToolTag::Pytom);
        assert_eq!(JobKind::DenoisePredict.tool_tag(), ToolTag::Cryocare);
        assert_eq!(JobKind::SubtomoExtraction.tool_tag(), ToolTag::Relion);
    }

    #[test]
    fn test_status_label_mapping() {
        assert_eq!(
            JobStatus::from_process_label("Running"),
            Some(JobStatus::Running)
        );
        assert_eq!(
            JobStatus::from_process_label("Pending"),
            Some(JobStatus::Scheduled)
        );
        assert_eq!(JobStatus::from_process_label("Weird"), None);
        assert!(JobStatus::Scheduled.is_mutable());
        assert!(!JobStatus::Succeeded.is_mutable());
    }

    #[test]
    fn test_set_field_roundtrip() {
        let mut params = JobParams::defaults_for(JobKind::TsAlignment);
        params.set_field("thickness_nm", &json!(300.0)).unwrap();
        match &params {
            JobParams::TsAlignment(p) => assert_eq!(p.thickness_nm, 300.0),
            other => panic!("unexpected params: {:?}", other),
        }
    }

    #[test]
    fn test_set_field_rejects_out_of_range() {
        let mut params = JobParams::defaults_for(JobKind::TsAlignment);
        let err = params.set_field("thickness_nm", &json!(20.0)).unwrap_err();
        assert!(matches!(err, FieldError::Invalid { .. }));

        let mut ctf = JobParams::defaults_for(JobKind::TsCtf);
        assert!(ctf.set_field("window", &json!(64)).is_err());
        assert!(ctf.set_field("window", &json!(1024)).is_ok());
    }

    #[test]
    fn test_set_field_rejects_unknown_field() {
        let mut params = JobParams::defaults_for(JobKind::ImportMovies);
        let err = params.set_field("pixel_size_angstrom", &json!(1.4)).unwrap_err();
        assert!(matches!(err, FieldError::Unknown(_)));
    }

    #[test]
    fn test_job_params_serde_tag() {
        let params = JobParams::defaults_for(JobKind::FsMotionAndCtf);
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["kind"], "fs_motion_and_ctf");
        let back: JobParams = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), JobKind::FsMotionAndCtf);
    }

    #[test]
    fn test_record_freeze() {
        let mut record = JobRecord::with_defaults(JobKind::TsCtf);
        assert!(!record.is_frozen());
        record.execution_status = JobStatus::Running;
        assert!(record.is_frozen());
        record.execution_status = JobStatus::Failed;
        assert!(record.is_frozen());
    }
}
