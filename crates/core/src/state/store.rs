//! The single-writer state store.
//!
//! Holds the current [`Project`] for one project directory. Mutations are
//! linearized through a `tokio::sync::Mutex` acquired for the whole
//! operation; readers receive point-in-time clones taken under the same
//! lock. Once the first snapshot has been written (at run time), every
//! accepted mutation is flushed to `project_params.json` immediately via
//! write-temp-then-rename, so partial writes never corrupt durable state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use cb_protocol::{GlobalGroup, JobKind, JobStatus, Project};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::mdoc::DetectedParams;
use crate::processes;

/// Durable snapshot file at the project root.
pub const SNAPSHOT_FILE: &str = "project_params.json";

struct StoreInner {
    project: Option<Project>,
    /// Set while the pipeline runner owns a live run; freezes globals and
    /// the selection.
    pipeline_active: bool,
    /// Set once the snapshot exists on disk; from then on mutations are
    /// flushed immediately.
    persisted: bool,
}

/// Single-writer store for one project.
pub struct StateStore {
    inner: Mutex<StoreInner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> StateStore {
        StateStore {
            inner: Mutex::new(StoreInner {
                project: None,
                pipeline_active: false,
                persisted: false,
            }),
        }
    }

    /// Create a fresh in-memory project. Nothing is written to disk yet;
    /// the configuration phase lives entirely in memory.
    pub async fn create_project(
        &self,
        name: &str,
        path: &Path,
        movies_glob: &str,
        mdocs_glob: &str,
        selected: &[JobKind],
        detected: &DetectedParams,
    ) -> CoreResult<Project> {
        let mut inner = self.inner.lock().await;
        let mut project = Project::new(
            name,
            path.display().to_string(),
            movies_glob,
            mdocs_glob,
            selected,
            Utc::now(),
        );
        apply_detected(&mut project, detected);
        inner.project = Some(project.clone());
        inner.pipeline_active = false;
        inner.persisted = false;
        info!(project = name, "project created in memory");
        Ok(project)
    }

    /// Load a snapshot from disk, validate it, and derive per-job statuses
    /// from the processes file.
    pub async fn open_project(&self, path: &Path) -> CoreResult<Project> {
        let snapshot_path = path.join(SNAPSHOT_FILE);
        if !snapshot_path.exists() {
            return Err(CoreError::NotFound {
                path: snapshot_path,
            });
        }
        let text = std::fs::read_to_string(&snapshot_path)
            .map_err(|e| CoreError::io(&snapshot_path, e))?;
        let mut project: Project =
            serde_json::from_str(&text).map_err(|e| CoreError::SnapshotInvalid {
                path: snapshot_path.clone(),
                reason: e.to_string(),
            })?;
        project
            .validate()
            .map_err(|reason| CoreError::SnapshotInvalid {
                path: snapshot_path.clone(),
                reason,
            })?;
        // The directory may have been moved since the snapshot was written.
        project.path = path.display().to_string();

        if let Ok(rows) = processes::read_processes(path) {
            let statuses = processes::derive_statuses(path, &project.selected_jobs, &rows);
            for (kind, status) in &statuses {
                if let Some(record) = project.jobs.get_mut(kind) {
                    record.execution_status = *status;
                }
            }
        }

        let mut inner = self.inner.lock().await;
        inner.project = Some(project.clone());
        inner.persisted = true;
        inner.pipeline_active = false;
        info!(project = project.name, "project opened from {}", path.display());
        Ok(project)
    }

    /// Point-in-time clone of the current project.
    pub async fn snapshot(&self) -> CoreResult<Project> {
        let inner = self.inner.lock().await;
        inner.project.clone().ok_or(CoreError::NoProject)
    }

    pub async fn is_pipeline_active(&self) -> bool {
        self.inner.lock().await.pipeline_active
    }

    /// Runner lifecycle hook.
    pub async fn set_pipeline_active(&self, active: bool) {
        let mut inner = self.inner.lock().await;
        inner.pipeline_active = active;
        debug!(active, "pipeline activity flag updated");
    }

    /// Set one global field. Globals freeze for the lifetime of a run:
    /// while the runner is active or any job is in a running state.
    pub async fn set_global(
        &self,
        group: GlobalGroup,
        field: &str,
        value: &Value,
    ) -> CoreResult<Project> {
        let mut inner = self.inner.lock().await;
        if globals_frozen(&inner) {
            return Err(CoreError::FrozenJob {
                target: "global parameters".to_string(),
            });
        }
        let project = inner.project.as_mut().ok_or(CoreError::NoProject)?;
        project
            .set_global(group, field, value)
            .map_err(|e| CoreError::Validation {
                field: field.to_string(),
                reason: e.to_string(),
            })?;
        project.modified_at = Utc::now();
        flush_if_persisted(&mut inner)?;
        self.cloned(&inner)
    }

    /// Set one job-specific field. Frozen records reject mutations and
    /// leave state unchanged; still-scheduled records stay editable even
    /// while the pipeline runs, and the change is flushed atomically.
    pub async fn set_job_field(
        &self,
        kind: JobKind,
        field: &str,
        value: &Value,
    ) -> CoreResult<Project> {
        let mut inner = self.inner.lock().await;
        let project = inner.project.as_mut().ok_or(CoreError::NoProject)?;
        let record = project
            .jobs
            .get_mut(&kind)
            .ok_or_else(|| CoreError::Validation {
                field: field.to_string(),
                reason: format!("job '{kind}' is not selected"),
            })?;
        if record.is_frozen() {
            return Err(CoreError::FrozenJob {
                target: kind.to_string(),
            });
        }
        record
            .params
            .set_field(field, value)
            .map_err(|e| CoreError::Validation {
                field: field.to_string(),
                reason: e.to_string(),
            })?;
        project.modified_at = Utc::now();
        flush_if_persisted(&mut inner)?;
        self.cloned(&inner)
    }

    /// Add a kind to the selection, allocating a default record. Only
    /// allowed while no job is running. The optional position must agree
    /// with the canonical pipeline order.
    pub async fn select_job(&self, kind: JobKind, position: Option<usize>) -> CoreResult<Project> {
        let mut inner = self.inner.lock().await;
        if inner.pipeline_active || any_running(&inner) {
            return Err(CoreError::PipelineActive);
        }
        let project = inner.project.as_mut().ok_or(CoreError::NoProject)?;
        if project.selected_jobs.contains(&kind) {
            return Err(CoreError::Validation {
                field: kind.to_string(),
                reason: "job is already selected".to_string(),
            });
        }
        let insert_at = project
            .selected_jobs
            .iter()
            .position(|other| other.ordinal() > kind.ordinal())
            .unwrap_or(project.selected_jobs.len());
        if let Some(requested) = position {
            if requested != insert_at {
                return Err(CoreError::Validation {
                    field: kind.to_string(),
                    reason: format!(
                        "position {requested} conflicts with pipeline order (expected {insert_at})"
                    ),
                });
            }
        }
        project.selected_jobs.insert(insert_at, kind);
        project
            .jobs
            .insert(kind, cb_protocol::JobRecord::with_defaults(kind));
        project.modified_at = Utc::now();
        flush_if_persisted(&mut inner)?;
        self.cloned(&inner)
    }

    /// Drop a kind from the selection and its record with it.
    pub async fn deselect_job(&self, kind: JobKind) -> CoreResult<Project> {
        let mut inner = self.inner.lock().await;
        if inner.pipeline_active || any_running(&inner) {
            return Err(CoreError::PipelineActive);
        }
        let project = inner.project.as_mut().ok_or(CoreError::NoProject)?;
        if !project.selected_jobs.contains(&kind) {
            return Err(CoreError::Validation {
                field: kind.to_string(),
                reason: "job is not selected".to_string(),
            });
        }
        project.selected_jobs.retain(|k| *k != kind);
        project.jobs.remove(&kind);
        project.modified_at = Utc::now();
        flush_if_persisted(&mut inner)?;
        self.cloned(&inner)
    }

    /// Re-seed every record from kind-specific defaults and re-apply the
    /// metadata probe's findings. Forbidden while anything runs.
    pub async fn reset_to_defaults(&self, detected: &DetectedParams) -> CoreResult<Project> {
        let mut inner = self.inner.lock().await;
        if inner.pipeline_active || any_running(&inner) {
            return Err(CoreError::PipelineActive);
        }
        let project = inner.project.as_mut().ok_or(CoreError::NoProject)?;
        for (&kind, record) in project.jobs.iter_mut() {
            *record = cb_protocol::JobRecord::with_defaults(kind);
        }
        project.microscope = Default::default();
        project.acquisition = Default::default();
        apply_detected(project, detected);
        project.modified_at = Utc::now();
        flush_if_persisted(&mut inner)?;
        self.cloned(&inner)
    }

    /// Ingest watcher-derived statuses. Records entering running or
    /// terminal states freeze in place.
    pub async fn apply_statuses(&self, statuses: &BTreeMap<JobKind, JobStatus>) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let project = inner.project.as_mut().ok_or(CoreError::NoProject)?;
        let mut changed = false;
        for (kind, status) in statuses {
            if let Some(record) = project.jobs.get_mut(kind) {
                if record.execution_status != *status {
                    record.execution_status = *status;
                    changed = true;
                }
            }
        }
        if changed {
            project.modified_at = Utc::now();
            flush_if_persisted(&mut inner)?;
        }
        Ok(())
    }

    /// Atomically write the snapshot. From this point on, accepted
    /// mutations flush to disk immediately.
    pub async fn snapshot_to_disk(&self) -> CoreResult<PathBuf> {
        let mut inner = self.inner.lock().await;
        let project = inner.project.as_mut().ok_or(CoreError::NoProject)?;
        project.modified_at = Utc::now();
        let path = write_snapshot(project)?;
        inner.persisted = true;
        Ok(path)
    }

    fn cloned(&self, inner: &StoreInner) -> CoreResult<Project> {
        inner.project.clone().ok_or(CoreError::NoProject)
    }
}

fn any_running(inner: &StoreInner) -> bool {
    inner
        .project
        .as_ref()
        .map(|p| {
            p.jobs
                .values()
                .any(|r| r.execution_status == JobStatus::Running)
        })
        .unwrap_or(false)
}

fn globals_frozen(inner: &StoreInner) -> bool {
    inner.pipeline_active || any_running(inner)
}

fn flush_if_persisted(inner: &mut StoreInner) -> CoreResult<()> {
    if !inner.persisted {
        return Ok(());
    }
    if let Some(project) = inner.project.as_ref() {
        write_snapshot(project)?;
    }
    Ok(())
}

/// Write `project_params.json` via temp file + rename.
fn write_snapshot(project: &Project) -> CoreResult<PathBuf> {
    let root = PathBuf::from(&project.path);
    let target = root.join(SNAPSHOT_FILE);
    let temp = root.join(format!(".{SNAPSHOT_FILE}.tmp"));

    let mut body = serde_json::to_string_pretty(project).map_err(|e| CoreError::SnapshotInvalid {
        path: target.clone(),
        reason: e.to_string(),
    })?;
    body.push('\n');

    std::fs::write(&temp, body).map_err(|e| CoreError::io(&temp, e))?;
    std::fs::rename(&temp, &target).map_err(|e| CoreError::io(&target, e))?;
    debug!("snapshot written to {}", target.display());
    Ok(target)
}

/// Seed a project's global parameters from whatever the metadata probe
/// could read. Absent fields leave the current values alone.
pub fn apply_detected(project: &mut Project, detected: &DetectedParams) {
    if let Some(v) = detected.pixel_spacing {
        project.microscope.pixel_size_angstrom = v;
    }
    if let Some(v) = detected.voltage {
        project.microscope.acceleration_voltage_kv = v;
    }
    if let Some(v) = detected.dose_per_tilt {
        project.acquisition.dose_per_tilt = v;
    }
    if let Some(v) = detected.frame_dose {
        project.acquisition.frame_dose = Some(v);
    }
    if let Some(v) = detected.tilt_axis_angle {
        project.acquisition.tilt_axis_degrees = v;
    }
    if let Some(v) = detected.detector_dimensions {
        project.acquisition.detector_dimensions = v;
    }
    if let Some(v) = detected.eer_fractions_per_frame {
        project.acquisition.eer_fractions_per_frame = Some(v);
    }
    if let Some(v) = &detected.acquisition_software {
        project.acquisition.acquisition_software = v.clone();
    }
    if let Some(v) = detected.invert_tilt_angles {
        project.acquisition.invert_tilt_angles = v;
    }
    if detected.pixel_spacing.is_none() && detected.voltage.is_none() {
        warn!("metadata probe found nothing; keeping configured defaults");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn detected() -> DetectedParams {
        DetectedParams {
            pixel_spacing: Some(1.35),
            voltage: Some(300.0),
            dose_per_tilt: Some(3.15),
            tilt_axis_angle: Some(95.3),
            ..Default::default()
        }
    }

    async fn store_with_project(path: &Path) -> StateStore {
        let store = StateStore::new();
        store
            .create_project(
                "demo",
                path,
                "/data/demo/*.eer",
                "/data/demo/*.mdoc",
                &[
                    JobKind::ImportMovies,
                    JobKind::FsMotionAndCtf,
                    JobKind::TsAlignment,
                ],
                &detected(),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_seeds_from_probe() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let project = store.snapshot().await.unwrap();
        assert_eq!(project.microscope.pixel_size_angstrom, 1.35);
        assert_eq!(project.acquisition.dose_per_tilt, 3.15);
        assert_eq!(project.acquisition.tilt_axis_degrees, 95.3);
    }

    #[tokio::test]
    async fn test_no_snapshot_until_requested() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        store
            .set_global(GlobalGroup::Microscope, "pixel_size_angstrom", &json!(1.4))
            .await
            .unwrap();
        assert!(!dir.path().join(SNAPSHOT_FILE).exists());

        store.snapshot_to_disk().await.unwrap();
        assert!(dir.path().join(SNAPSHOT_FILE).exists());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        store.snapshot_to_disk().await.unwrap();
        let written = store.snapshot().await.unwrap();

        let reopened = StateStore::new();
        let loaded = reopened.open_project(dir.path()).await.unwrap();
        assert_eq!(written, loaded);
    }

    #[tokio::test]
    async fn test_mutations_flush_after_persist() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        store.snapshot_to_disk().await.unwrap();

        store
            .set_job_field(JobKind::TsAlignment, "thickness_nm", &json!(300.0))
            .await
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join(SNAPSHOT_FILE)).unwrap();
        let parsed: Project = serde_json::from_str(&text).unwrap();
        match &parsed.jobs[&JobKind::TsAlignment].params {
            cb_protocol::JobParams::TsAlignment(p) => assert_eq!(p.thickness_nm, 300.0),
            other => panic!("unexpected params: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_frozen_job_rejects_mutation() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;

        let mut statuses = BTreeMap::new();
        statuses.insert(JobKind::ImportMovies, JobStatus::Running);
        store.apply_statuses(&statuses).await.unwrap();

        let err = store
            .set_job_field(JobKind::ImportMovies, "do_at_most", &json!(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::FrozenJob { .. }));

        // Downstream still-scheduled records remain mutable (scenario B).
        store
            .set_job_field(JobKind::TsAlignment, "thickness_nm", &json!(300.0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_globals_freeze_while_running() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        store.set_pipeline_active(true).await;

        let err = store
            .set_global(GlobalGroup::Microscope, "pixel_size_angstrom", &json!(1.4))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::FrozenJob { .. }));

        store.set_pipeline_active(false).await;
        store
            .set_global(GlobalGroup::Microscope, "pixel_size_angstrom", &json!(1.4))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validation_leaves_state_unchanged() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let before = store.snapshot().await.unwrap();

        let err = store
            .set_global(GlobalGroup::Microscope, "pixel_size_angstrom", &json!(0.4))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));

        let mut after = store.snapshot().await.unwrap();
        after.modified_at = before.modified_at;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_select_and_deselect() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;

        let project = store.select_job(JobKind::TsCtf, None).await.unwrap();
        assert_eq!(
            project.selected_jobs,
            vec![
                JobKind::ImportMovies,
                JobKind::FsMotionAndCtf,
                JobKind::TsAlignment,
                JobKind::TsCtf
            ]
        );
        assert!(project.jobs.contains_key(&JobKind::TsCtf));

        // Duplicate selection rejected.
        assert!(matches!(
            store.select_job(JobKind::TsCtf, None).await.unwrap_err(),
            CoreError::Validation { .. }
        ));

        // Position conflicting with pipeline order rejected.
        assert!(matches!(
            store.select_job(JobKind::TsReconstruct, Some(0)).await.unwrap_err(),
            CoreError::Validation { .. }
        ));

        let project = store.deselect_job(JobKind::TsCtf).await.unwrap();
        assert!(!project.jobs.contains_key(&JobKind::TsCtf));
    }

    #[tokio::test]
    async fn test_selection_locked_while_active() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        store.set_pipeline_active(true).await;

        assert!(matches!(
            store.select_job(JobKind::TsCtf, None).await.unwrap_err(),
            CoreError::PipelineActive
        ));
        assert!(matches!(
            store.deselect_job(JobKind::TsAlignment).await.unwrap_err(),
            CoreError::PipelineActive
        ));
    }

    #[tokio::test]
    async fn test_reset_to_defaults() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        store
            .set_job_field(JobKind::TsAlignment, "thickness_nm", &json!(500.0))
            .await
            .unwrap();

        let project = store.reset_to_defaults(&detected()).await.unwrap();
        match &project.jobs[&JobKind::TsAlignment].params {
            cb_protocol::JobParams::TsAlignment(p) => assert_eq!(p.thickness_nm, 200.0),
            other => panic!("unexpected params: {:?}", other),
        }
        // Probe findings re-applied on top of defaults.
        assert_eq!(project.microscope.pixel_size_angstrom, 1.35);
    }

    #[tokio::test]
    async fn test_reset_forbidden_while_running() {
        let dir = tempdir().unwrap();
        let store = store_with_project(dir.path()).await;
        let mut statuses = BTreeMap::new();
        statuses.insert(JobKind::ImportMovies, JobStatus::Running);
        store.apply_statuses(&statuses).await.unwrap();

        assert!(matches!(
            store.reset_to_defaults(&detected()).await.unwrap_err(),
            CoreError::PipelineActive
        ));
    }

    #[tokio::test]
    async fn test_open_missing_project() {
        let dir = tempdir().unwrap();
        let store = StateStore::new();
        assert!(matches!(
            store.open_project(dir.path()).await.unwrap_err(),
            CoreError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_open_invalid_snapshot() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SNAPSHOT_FILE), "{not json").unwrap();
        let store = StateStore::new();
        assert!(matches!(
            store.open_project(dir.path()).await.unwrap_err(),
            CoreError::SnapshotInvalid { .. }
        ));
    }
}
