//! Project state models and the durable snapshot format.
//!
//! The three global records (microscope, acquisition, computing) are the
//! single source of truth for parameters shared across jobs. Job records
//! never copy these fields; command builders read them at build time.
//!
//! [`Project`] is a bit-exact, lossless representation of the in-memory
//! state: serializing it with `serde_json` yields `project_params.json`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::job_models::{FieldError, JobKind, JobRecord};

fn invalid(field: &str, reason: impl Into<String>) -> FieldError {
    FieldError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn num(field: &str, value: &Value) -> Result<f64, FieldError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(field, "not a number")),
        Value::String(s) => s.parse::<f64>().map_err(|_| invalid(field, "not a number")),
        _ => Err(invalid(field, "expected a number")),
    }
}

fn boolean(field: &str, value: &Value) -> Result<bool, FieldError> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => Err(invalid(field, "expected a boolean")),
    }
}

fn string(field: &str, value: &Value) -> Result<String, FieldError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        _ => Err(invalid(field, "expected a string")),
    }
}

fn bounded(field: &str, v: f64, lo: f64, hi: f64) -> Result<f64, FieldError> {
    if v < lo || v > hi {
        Err(invalid(field, format!("must be within [{lo}, {hi}]")))
    } else {
        Ok(v)
    }
}

/// Optics of the instrument the data was collected on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct MicroscopeParams {
    pub pixel_size_angstrom: f64,
    pub acceleration_voltage_kv: f64,
    pub spherical_aberration_mm: f64,
    pub amplitude_contrast: f64,
}

impl Default for MicroscopeParams {
    fn default() -> Self {
        Self {
            pixel_size_angstrom: 1.35,
            acceleration_voltage_kv: 300.0,
            spherical_aberration_mm: 2.7,
            amplitude_contrast: 0.1,
        }
    }
}

impl MicroscopeParams {
    /// Set one field by name, enforcing the documented ranges
    /// (pixel size 0.5–10 Å, Cs 0–10 mm, amplitude contrast 0–1).
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "pixel_size_angstrom" => {
                self.pixel_size_angstrom = bounded(field, num(field, value)?, 0.5, 10.0)?
            }
            "acceleration_voltage_kv" => {
                let v = num(field, value)?;
                if v <= 0.0 {
                    return Err(invalid(field, "must be positive"));
                }
                self.acceleration_voltage_kv = v;
            }
            "spherical_aberration_mm" => {
                self.spherical_aberration_mm = bounded(field, num(field, value)?, 0.0, 10.0)?
            }
            "amplitude_contrast" => {
                self.amplitude_contrast = bounded(field, num(field, value)?, 0.0, 1.0)?
            }
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// How the tilt series were acquired.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct AcquisitionParams {
    pub dose_per_tilt: f64,
    pub tilt_axis_degrees: f64,
    pub detector_dimensions: (u32, u32),
    pub eer_fractions_per_frame: Option<u32>,
    pub gain_reference_path: Option<String>,
    pub invert_defocus_hand: bool,
    pub invert_tilt_angles: bool,
    pub acquisition_software: String,
    pub frame_dose: Option<f64>,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            dose_per_tilt: 3.0,
            tilt_axis_degrees: -95.0,
            detector_dimensions: (4096, 4096),
            eer_fractions_per_frame: None,
            gain_reference_path: None,
            invert_defocus_hand: false,
            invert_tilt_angles: false,
            acquisition_software: "SerialEM".to_string(),
            frame_dose: None,
        }
    }
}

impl AcquisitionParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "dose_per_tilt" => {
                let v = num(field, value)?;
                if v < 0.1 {
                    return Err(invalid(field, "must be at least 0.1"));
                }
                self.dose_per_tilt = v;
            }
            "tilt_axis_degrees" => {
                self.tilt_axis_degrees = bounded(field, num(field, value)?, -180.0, 180.0)?
            }
            "detector_dimensions" => {
                let pair: (u32, u32) = serde_json::from_value(value.clone())
                    .map_err(|_| invalid(field, "expected [width, height]"))?;
                self.detector_dimensions = pair;
            }
            "eer_fractions_per_frame" => {
                self.eer_fractions_per_frame = match value {
                    Value::Null => None,
                    other => {
                        let v = num(field, other)? as i64;
                        if !(1..=100).contains(&v) {
                            return Err(invalid(field, "must be within [1, 100]"));
                        }
                        Some(v as u32)
                    }
                }
            }
            "gain_reference_path" => {
                self.gain_reference_path = match value {
                    Value::Null => None,
                    other => Some(string(field, other)?),
                }
            }
            "invert_defocus_hand" => self.invert_defocus_hand = boolean(field, value)?,
            "invert_tilt_angles" => self.invert_tilt_angles = boolean(field, value)?,
            "acquisition_software" => self.acquisition_software = string(field, value)?,
            "frame_dose" => {
                self.frame_dose = match value {
                    Value::Null => None,
                    other => Some(num(field, other)?),
                }
            }
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }
}

/// Cluster submission defaults for the project.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct ComputingParams {
    pub partition: String,
    pub nodes: u32,
    pub ntasks_per_node: u32,
    pub cpus_per_task: u32,
    pub gres: String,
    pub mem: String,
    pub time: String,
}

impl Default for ComputingParams {
    fn default() -> Self {
        Self {
            partition: "g".to_string(),
            nodes: 1,
            ntasks_per_node: 1,
            cpus_per_task: 4,
            gres: "gpu:1".to_string(),
            mem: "32G".to_string(),
            time: "2:00:00".to_string(),
        }
    }
}

impl ComputingParams {
    pub fn set_field(&mut self, field: &str, value: &Value) -> Result<(), FieldError> {
        match field {
            "partition" => self.partition = string(field, value)?,
            "nodes" => self.nodes = num(field, value)? as u32,
            "ntasks_per_node" => self.ntasks_per_node = num(field, value)? as u32,
            "cpus_per_task" => self.cpus_per_task = num(field, value)? as u32,
            "gres" => self.gres = string(field, value)?,
            "mem" => self.mem = string(field, value)?,
            "time" => self.time = string(field, value)?,
            _ => return Err(FieldError::Unknown(field.to_string())),
        }
        Ok(())
    }

    /// GPU count parsed from the GRES string (`gpu:2` or `gpu:a100:2`).
    pub fn gpu_count(&self) -> u32 {
        self.gres
            .rsplit(':')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }
}

/// A reference to one global parameter group.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum GlobalGroup {
    Microscope,
    Acquisition,
    Computing,
}

/// The complete project state.
///
/// Serialized as-is to `project_params.json`; timestamps are ISO-8601 UTC
/// and all numerics are plain JSON numbers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, TS)]
pub struct Project {
    pub name: String,
    pub path: String,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub modified_at: DateTime<Utc>,
    pub movies_glob: String,
    pub mdocs_glob: String,
    pub microscope: MicroscopeParams,
    pub acquisition: AcquisitionParams,
    pub computing: ComputingParams,
    /// Selected kinds in pipeline order.
    pub selected_jobs: Vec<JobKind>,
    /// One record per selected kind.
    pub jobs: BTreeMap<JobKind, JobRecord>,
}

impl Project {
    /// A fresh in-memory project with default globals and one default
    /// record per selected kind. Selection is stored sorted in canonical
    /// pipeline order.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        movies_glob: impl Into<String>,
        mdocs_glob: impl Into<String>,
        selected: &[JobKind],
        now: DateTime<Utc>,
    ) -> Project {
        let mut selected_jobs: Vec<JobKind> = selected.to_vec();
        selected_jobs.sort();
        selected_jobs.dedup();
        let jobs = selected_jobs
            .iter()
            .map(|&kind| (kind, JobRecord::with_defaults(kind)))
            .collect();
        Project {
            name: name.into(),
            path: path.into(),
            created_at: now,
            modified_at: now,
            movies_glob: movies_glob.into(),
            mdocs_glob: mdocs_glob.into(),
            microscope: MicroscopeParams::default(),
            acquisition: AcquisitionParams::default(),
            computing: ComputingParams::default(),
            selected_jobs,
            jobs,
        }
    }

    /// Set a global field addressed as `<group>.<field>`.
    pub fn set_global(&mut self, group: GlobalGroup, field: &str, value: &Value) -> Result<(), FieldError> {
        match group {
            GlobalGroup::Microscope => self.microscope.set_field(field, value),
            GlobalGroup::Acquisition => self.acquisition.set_field(field, value),
            GlobalGroup::Computing => self.computing.set_field(field, value),
        }
    }

    /// Structural validity of a snapshot read back from disk: the job map
    /// and the selection list must describe the same set of kinds, and
    /// each record's tagged params must match its key.
    pub fn validate(&self) -> Result<(), String> {
        for kind in &self.selected_jobs {
            if !self.jobs.contains_key(kind) {
                return Err(format!("selected job '{kind}' has no record"));
            }
        }
        for (kind, record) in &self.jobs {
            if record.kind() != *kind {
                return Err(format!(
                    "record keyed '{kind}' carries params for '{}'",
                    record.kind()
                ));
            }
            if !self.selected_jobs.contains(kind) {
                return Err(format!("record '{kind}' is not in the selection list"));
            }
        }
        let mut sorted = self.selected_jobs.clone();
        sorted.sort();
        if sorted != self.selected_jobs {
            return Err("selected jobs are not in pipeline order".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_models::JobStatus;
    use serde_json::json;

    fn sample() -> Project {
        Project::new(
            "demo",
            "/tmp/projects/demo",
            "/data/demo/*.eer",
            "/data/demo/*.mdoc",
            &[JobKind::ImportMovies, JobKind::FsMotionAndCtf, JobKind::TsAlignment],
            Utc::now(),
        )
    }

    #[test]
    fn test_new_project_allocates_records() {
        let project = sample();
        assert_eq!(project.selected_jobs.len(), 3);
        assert_eq!(project.jobs.len(), 3);
        assert!(project.jobs.contains_key(&JobKind::TsAlignment));
        assert_eq!(
            project.jobs[&JobKind::ImportMovies].execution_status,
            JobStatus::Scheduled
        );
        project.validate().unwrap();
    }

    #[test]
    fn test_selection_sorted_to_pipeline_order() {
        let project = Project::new(
            "p",
            "/tmp/p",
            "",
            "",
            &[JobKind::TsAlignment, JobKind::ImportMovies],
            Utc::now(),
        );
        assert_eq!(
            project.selected_jobs,
            vec![JobKind::ImportMovies, JobKind::TsAlignment]
        );
    }

    #[test]
    fn test_pixel_size_bounds() {
        let mut project = sample();
        assert!(project
            .set_global(GlobalGroup::Microscope, "pixel_size_angstrom", &json!(0.4))
            .is_err());
        assert!(project
            .set_global(GlobalGroup::Microscope, "pixel_size_angstrom", &json!(10.1))
            .is_err());
        assert!(project
            .set_global(GlobalGroup::Microscope, "pixel_size_angstrom", &json!(1.4))
            .is_ok());
        assert_eq!(project.microscope.pixel_size_angstrom, 1.4);
    }

    #[test]
    fn test_acquisition_bounds() {
        let mut project = sample();
        assert!(project
            .set_global(GlobalGroup::Acquisition, "dose_per_tilt", &json!(0.05))
            .is_err());
        assert!(project
            .set_global(GlobalGroup::Acquisition, "tilt_axis_degrees", &json!(-181.0))
            .is_err());
        assert!(project
            .set_global(GlobalGroup::Acquisition, "tilt_axis_degrees", &json!(-95.5))
            .is_ok());
    }

    #[test]
    fn test_gpu_count_from_gres() {
        let mut computing = ComputingParams::default();
        assert_eq!(computing.gpu_count(), 1);
        computing.gres = "gpu:a100:4".to_string();
        assert_eq!(computing.gpu_count(), 4);
        computing.gres = "".to_string();
        assert_eq!(computing.gpu_count(), 0);
    }

    #[test]
    fn test_validate_rejects_mismatched_record() {
        let mut project = sample();
        let record = project.jobs.remove(&JobKind::TsAlignment).unwrap();
        project.jobs.insert(JobKind::TsCtf, record);
        assert!(project.validate().is_err());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let project = sample();
        let json = serde_json::to_string_pretty(&project).unwrap();
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(project, back);
    }
}
