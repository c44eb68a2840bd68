//! Reading and interpreting the pipeliner's processes file.
//!
//! `default_pipeline.star` at the project root is the only observable
//! channel for live job status. The pipeliner owns it; the orchestrator
//! reads it with retry tolerance, and rewrites a single row only during an
//! explicit abort.

use std::collections::BTreeMap;
use std::path::Path;

use cb_protocol::{JobKind, JobStatus, ProgressCounters};

use crate::error::{CoreError, CoreResult};
use crate::star::{StarBlock, StarDocument};

/// Name of the processes file at the project root.
pub const PROCESSES_FILE: &str = "default_pipeline.star";

/// One row of the processes table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    /// Job directory relative to the project root, e.g. `External/job003/`.
    pub name: String,
    pub alias: String,
    pub status_label: String,
}

/// Read the processes table. `Ok(vec![])` when the file exists but holds
/// no processes yet; `NotFound` when the file is absent.
pub fn read_processes(project_root: &Path) -> CoreResult<Vec<ProcessRow>> {
    let path = project_root.join(PROCESSES_FILE);
    if !path.exists() {
        return Err(CoreError::NotFound { path });
    }
    let text = std::fs::read_to_string(&path).map_err(|e| CoreError::io(&path, e))?;
    let doc = StarDocument::parse(&text).map_err(|reason| CoreError::Star {
        path: path.clone(),
        reason,
    })?;

    let Some(block) = doc.block("pipeline_processes") else {
        return Ok(Vec::new());
    };
    let rows = block
        .row_maps()
        .into_iter()
        .map(|row| ProcessRow {
            name: row
                .get("rlnPipeLineProcessName")
                .copied()
                .unwrap_or_default()
                .to_string(),
            alias: row
                .get("rlnPipeLineProcessAlias")
                .copied()
                .unwrap_or_default()
                .to_string(),
            status_label: row
                .get("rlnPipeLineProcessStatusLabel")
                .copied()
                .unwrap_or_default()
                .to_string(),
        })
        .collect();
    Ok(rows)
}

/// Resolve which JobKind a process row belongs to.
///
/// Resolution order: the scheme-relative path in the name or alias, then
/// the `Import/` category shortcut, then the job directory's own `job.star`
/// (whose `fn_exe` names either the driver script or the import tool).
pub fn resolve_kind(project_root: &Path, row: &ProcessRow) -> Option<JobKind> {
    for haystack in [&row.alias, &row.name] {
        for kind in JobKind::ALL {
            if path_contains_segment(haystack, kind.as_str()) {
                return Some(kind);
            }
        }
    }
    if row.name.starts_with("Import/job") {
        return Some(JobKind::ImportMovies);
    }
    kind_from_job_star(project_root, &row.name)
}

fn path_contains_segment(path: &str, segment: &str) -> bool {
    path.split('/').any(|part| part == segment)
}

/// Sniff the job kind from a job directory's `fn_exe` value.
fn kind_from_job_star(project_root: &Path, process_name: &str) -> Option<JobKind> {
    let job_star = project_root
        .join(process_name.trim_end_matches('/'))
        .join("job.star");
    let text = std::fs::read_to_string(&job_star).ok()?;
    let doc = StarDocument::parse(&text).ok()?;
    let options = doc.block("joboptions_values")?;
    let fn_exe = options
        .row_maps()
        .into_iter()
        .find(|row| row.get("rlnJobOptionVariable") == Some(&"fn_exe"))
        .and_then(|row| row.get("rlnJobOptionValue").map(|v| v.to_string()))?;

    for kind in JobKind::ALL {
        if fn_exe.contains(&format!("/drivers/{}.py", kind)) {
            return Some(kind);
        }
    }
    if fn_exe.contains("relion_import") {
        return Some(JobKind::ImportMovies);
    }
    None
}

/// Derive per-kind statuses for the project's selection.
///
/// A selected kind listed in the file takes its latest row's label; a
/// selected kind not listed is `Scheduled`. Kinds outside the selection
/// are `NotScheduled` and omitted from the map.
pub fn derive_statuses(
    project_root: &Path,
    selected: &[JobKind],
    rows: &[ProcessRow],
) -> BTreeMap<JobKind, JobStatus> {
    let mut statuses: BTreeMap<JobKind, JobStatus> = selected
        .iter()
        .map(|&kind| (kind, JobStatus::Scheduled))
        .collect();

    for row in rows {
        let Some(kind) = resolve_kind(project_root, row) else {
            continue;
        };
        if !statuses.contains_key(&kind) {
            continue;
        }
        if let Some(status) = JobStatus::from_process_label(&row.status_label) {
            // Later rows win: the pipeliner appends re-runs.
            statuses.insert(kind, status);
        }
    }
    statuses
}

/// Aggregate counters over every row of the processes file.
pub fn counters(rows: &[ProcessRow]) -> ProgressCounters {
    let mut counters = ProgressCounters {
        total: rows.len(),
        ..Default::default()
    };
    for row in rows {
        match row.status_label.as_str() {
            "Succeeded" => counters.succeeded += 1,
            "Running" => counters.running += 1,
            "Failed" => counters.failed += 1,
            _ => {}
        }
    }
    counters
}

/// The single currently-running row, if any.
pub fn find_running(rows: &[ProcessRow]) -> Option<&ProcessRow> {
    rows.iter().find(|row| row.status_label == "Running")
}

/// Rewrite one process row's status label in place (abort path only).
///
/// The success-marker check lives with the caller; this function is a
/// plain read-modify-write of the table.
pub fn rewrite_status(project_root: &Path, process_name: &str, new_label: &str) -> CoreResult<()> {
    let path = project_root.join(PROCESSES_FILE);
    let text = std::fs::read_to_string(&path).map_err(|e| CoreError::io(&path, e))?;
    let mut doc = StarDocument::parse(&text).map_err(|reason| CoreError::Star {
        path: path.clone(),
        reason,
    })?;

    if let Some(StarBlock::Loop { columns, rows }) = doc.block_mut("pipeline_processes") {
        let name_col = columns
            .iter()
            .position(|c| c == "rlnPipeLineProcessName")
            .unwrap_or(0);
        let status_col = columns
            .iter()
            .position(|c| c == "rlnPipeLineProcessStatusLabel")
            .unwrap_or(columns.len().saturating_sub(1));
        for row in rows.iter_mut() {
            if row[name_col] == process_name {
                row[status_col] = new_label.to_string();
            }
        }
    }

    std::fs::write(&path, doc.to_star_string()).map_err(|e| CoreError::io(&path, e))
}
