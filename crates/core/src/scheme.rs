//! Scheme materialization.
//!
//! A scheme is the on-disk artifact the downstream pipeliner consumes: a
//! top-level `scheme.star` plus one subdirectory per selected job holding a
//! `job.star` with the fully wrapped command baked into `fn_exe`. Schemes
//! are created per run and never edited afterwards; materializing the same
//! project state under the same name is byte-identical.

use std::path::{Path, PathBuf};

use cb_protocol::{JobKind, Project};
use tracing::info;

use crate::command::{build_command, ResolvedPaths};
use crate::config::AppConfig;
use crate::container::{BindContext, ContainerWrapper};
use crate::error::{CoreError, CoreResult};
use crate::mdoc::glob_parent;
use crate::star::{format_float, StarBlock, StarDocument};

/// Scheme float variables: initial value equals reset value.
const DO_AT_MOST: f64 = 500.0;
const MAXTIME_HR: f64 = 96.0;
const WAIT_SEC: f64 = 10.0;

/// Materialize `Schemes/<scheme_name>/` for the project's selection.
///
/// `templates_dir` is the server-shipped scheme template directory; its
/// final path component is the template scheme name whose references get
/// rewritten to the new name.
///
/// # Errors
///
/// Fails if a selected kind has no template subdirectory, a template
/// `job.star` is malformed, or a command cannot be built.
pub fn materialize_scheme(
    config: &AppConfig,
    project: &Project,
    templates_dir: &Path,
    scheme_name: &str,
) -> CoreResult<PathBuf> {
    let project_root = PathBuf::from(&project.path);
    let scheme_dir = project_root.join("Schemes").join(scheme_name);
    std::fs::create_dir_all(&scheme_dir).map_err(|e| CoreError::io(&scheme_dir, e))?;

    let template_name = templates_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("warp_tomo_prep")
        .to_string();

    let paths = ResolvedPaths::for_project_root(&project_root);
    let wrapper = ContainerWrapper::new(config);
    let extra_binds: Vec<PathBuf> = [
        glob_parent(&project.movies_glob),
        glob_parent(&project.mdocs_glob),
    ]
    .into_iter()
    .filter(|p| p.as_os_str().len() > 1)
    .collect();
    let base = project_root
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
    let bind_ctx = BindContext::new(&project_root, base).with_extra_binds(extra_binds);

    for &kind in &project.selected_jobs {
        let template_job_dir = templates_dir.join(kind.as_str());
        if !template_job_dir.is_dir() {
            return Err(CoreError::NotFound {
                path: template_job_dir,
            });
        }
        let dest_job_dir = scheme_dir.join(kind.as_str());
        copy_dir(&template_job_dir, &dest_job_dir)?;

        let job_star_path = dest_job_dir.join("job.star");
        let text = std::fs::read_to_string(&job_star_path)
            .map_err(|e| CoreError::io(&job_star_path, e))?;
        let mut doc = StarDocument::parse(&text).map_err(|reason| CoreError::Star {
            path: job_star_path.clone(),
            reason,
        })?;

        let raw = build_command(kind, project, &paths)?;
        let wrapped = wrapper.wrap(kind.tool_tag(), &raw, &bind_ctx);
        rewrite_job_star(&mut doc, &wrapped, &template_name, scheme_name);

        std::fs::write(&job_star_path, doc.to_star_string())
            .map_err(|e| CoreError::io(&job_star_path, e))?;
    }

    let scheme_star = scheme_star_document(scheme_name, &project.selected_jobs);
    let scheme_star_path = scheme_dir.join("scheme.star");
    std::fs::write(&scheme_star_path, scheme_star.to_star_string())
        .map_err(|e| CoreError::io(&scheme_star_path, e))?;

    info!(
        scheme = scheme_name,
        jobs = project.selected_jobs.len(),
        "scheme materialized at {}",
        scheme_dir.display()
    );
    Ok(scheme_dir)
}

/// Rewrite one job description in place: inject the wrapped command, clear
/// `other_args`, drop the legacy `paramN` aliasing rows, and retarget any
/// template-scheme path references.
pub fn rewrite_job_star(
    doc: &mut StarDocument,
    final_command: &str,
    template_name: &str,
    scheme_name: &str,
) {
    let template_ref = format!("Schemes/{template_name}/");
    let scheme_ref = format!("Schemes/{scheme_name}/");

    if let Some(StarBlock::Loop { columns, rows }) = doc.block_mut("joboptions_values") {
        let var_col = columns
            .iter()
            .position(|c| c == "rlnJobOptionVariable")
            .unwrap_or(0);
        let val_col = columns
            .iter()
            .position(|c| c == "rlnJobOptionValue")
            .unwrap_or(1);

        rows.retain(|row| !is_param_alias(&row[var_col]));

        let mut saw_fn_exe = false;
        for row in rows.iter_mut() {
            match row[var_col].as_str() {
                "fn_exe" => {
                    row[val_col] = final_command.to_string();
                    saw_fn_exe = true;
                }
                "other_args" => row[val_col] = String::new(),
                _ => {
                    if row[val_col].contains(&template_ref) {
                        row[val_col] = row[val_col].replace(&template_ref, &scheme_ref);
                    }
                }
            }
        }
        if !saw_fn_exe {
            rows.push(vec!["fn_exe".to_string(), final_command.to_string()]);
        }
    }
}

/// `paramN_label` / `paramN_value` rows carried the pipeliner's per-job
/// parameter aliasing indirection; everything is baked into `fn_exe` now.
fn is_param_alias(variable: &str) -> bool {
    let Some(rest) = variable.strip_prefix("param") else {
        return false;
    };
    let Some(idx) = rest.find('_') else {
        return false;
    };
    let (digits, suffix) = rest.split_at(idx);
    !digits.is_empty()
        && digits.chars().all(|c| c.is_ascii_digit())
        && (suffix == "_label" || suffix == "_value")
}

/// Synthesize the top-level scheme description for a selection.
pub fn scheme_star_document(scheme_name: &str, selected: &[JobKind]) -> StarDocument {
    let mut doc = StarDocument::new();

    let mut general = StarBlock::KeyValue(Vec::new());
    general.set("rlnSchemeName", format!("Schemes/{scheme_name}/"));
    general.set("rlnSchemeCurrentNodeName", "WAIT");
    doc.push("scheme_general", general);

    doc.push(
        "scheme_floats",
        StarBlock::Loop {
            columns: vec![
                "rlnSchemeFloatVariableName".to_string(),
                "rlnSchemeFloatVariableValue".to_string(),
                "rlnSchemeFloatVariableResetValue".to_string(),
            ],
            rows: vec![
                float_row("do_at_most", DO_AT_MOST),
                float_row("maxtime_hr", MAXTIME_HR),
                float_row("wait_sec", WAIT_SEC),
            ],
        },
    );

    doc.push(
        "scheme_operators",
        StarBlock::Loop {
            columns: vec![
                "rlnSchemeOperatorName".to_string(),
                "rlnSchemeOperatorType".to_string(),
                "rlnSchemeOperatorOutput".to_string(),
                "rlnSchemeOperatorInput1".to_string(),
                "rlnSchemeOperatorInput2".to_string(),
            ],
            rows: vec![
                operator_row("EXIT", "exit", "undefined"),
                operator_row("EXIT_maxtime", "exit_maxtime", "maxtime_hr"),
                operator_row("WAIT", "wait", "wait_sec"),
            ],
        },
    );

    doc.push(
        "scheme_jobs",
        StarBlock::Loop {
            columns: vec![
                "rlnSchemeJobNameOriginal".to_string(),
                "rlnSchemeJobName".to_string(),
                "rlnSchemeJobMode".to_string(),
                "rlnSchemeJobHasStarted".to_string(),
            ],
            rows: selected
                .iter()
                .map(|kind| {
                    vec![
                        kind.to_string(),
                        kind.to_string(),
                        "continue".to_string(),
                        "0".to_string(),
                    ]
                })
                .collect(),
        },
    );

    doc.push(
        "scheme_edges",
        StarBlock::Loop {
            columns: vec![
                "rlnSchemeEdgeInputNodeName".to_string(),
                "rlnSchemeEdgeOutputNodeName".to_string(),
                "rlnSchemeEdgeIsFork".to_string(),
                "rlnSchemeEdgeOutputNodeNameIfTrue".to_string(),
                "rlnSchemeEdgeBooleanVariable".to_string(),
            ],
            rows: edge_rows(selected),
        },
    );

    doc
}

fn float_row(name: &str, value: f64) -> Vec<String> {
    vec![
        name.to_string(),
        format_float(value),
        format_float(value),
    ]
}

fn operator_row(name: &str, kind: &str, input1: &str) -> Vec<String> {
    vec![
        name.to_string(),
        kind.to_string(),
        "undefined".to_string(),
        input1.to_string(),
        "undefined".to_string(),
    ]
}

/// The mandatory `WAIT → EXIT_maxtime → j₀ → … → jₙ₋₁ → EXIT` chain,
/// fork-free.
fn edge_rows(selected: &[JobKind]) -> Vec<Vec<String>> {
    let edge = |from: String, to: String| -> Vec<String> {
        vec![
            from,
            to,
            "0".to_string(),
            "undefined".to_string(),
            "undefined".to_string(),
        ]
    };

    let mut rows = vec![edge("WAIT".to_string(), "EXIT_maxtime".to_string())];
    let mut previous = "EXIT_maxtime".to_string();
    for kind in selected {
        rows.push(edge(previous, kind.to_string()));
        previous = kind.to_string();
    }
    rows.push(edge(previous, "EXIT".to_string()));
    rows
}

/// Recursive file copy of a template job subdirectory.
fn copy_dir(src: &Path, dest: &Path) -> CoreResult<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| CoreError::Star {
            path: src.to_path_buf(),
            reason: e.to_string(),
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| CoreError::io(&target, e))?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| CoreError::io(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_chain_shape() {
        let selected = [
            JobKind::ImportMovies,
            JobKind::FsMotionAndCtf,
            JobKind::TsAlignment,
        ];
        let rows = edge_rows(&selected);
        let pairs: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r[0].as_str(), r[1].as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("WAIT", "EXIT_maxtime"),
                ("EXIT_maxtime", "import_movies"),
                ("import_movies", "fs_motion_and_ctf"),
                ("fs_motion_and_ctf", "ts_alignment"),
                ("ts_alignment", "EXIT"),
            ]
        );
        assert!(rows.iter().all(|r| r[2] == "0"));
    }

    #[test]
    fn test_scheme_star_blocks_in_fixed_order() {
        let doc = scheme_star_document("scheme_demo", &[JobKind::ImportMovies]);
        let names: Vec<&str> = doc.blocks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "scheme_general",
                "scheme_floats",
                "scheme_operators",
                "scheme_jobs",
                "scheme_edges"
            ]
        );

        let general = doc.block("scheme_general").unwrap();
        assert_eq!(general.get("rlnSchemeName"), Some("Schemes/scheme_demo/"));
        assert_eq!(general.get("rlnSchemeCurrentNodeName"), Some("WAIT"));
    }

    #[test]
    fn test_scheme_floats_reset_equals_value() {
        let doc = scheme_star_document("s", &[JobKind::ImportMovies]);
        for row in doc.block("scheme_floats").unwrap().row_maps() {
            assert_eq!(
                row["rlnSchemeFloatVariableValue"],
                row["rlnSchemeFloatVariableResetValue"]
            );
        }
    }

    #[test]
    fn test_scheme_operators() {
        let doc = scheme_star_document("s", &[JobKind::ImportMovies]);
        let rows = doc.block("scheme_operators").unwrap().row_maps();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["rlnSchemeOperatorName"], "EXIT");
        assert_eq!(rows[1]["rlnSchemeOperatorName"], "EXIT_maxtime");
        assert_eq!(rows[1]["rlnSchemeOperatorInput1"], "maxtime_hr");
        assert_eq!(rows[2]["rlnSchemeOperatorName"], "WAIT");
        assert_eq!(rows[2]["rlnSchemeOperatorInput1"], "wait_sec");
    }

    #[test]
    fn test_scheme_jobs_mode_continue() {
        let doc = scheme_star_document("s", &[JobKind::ImportMovies, JobKind::TsCtf]);
        let rows = doc.block("scheme_jobs").unwrap().row_maps();
        assert_eq!(rows.len(), 2);
        for row in rows {
            assert_eq!(
                row["rlnSchemeJobNameOriginal"],
                row["rlnSchemeJobName"]
            );
            assert_eq!(row["rlnSchemeJobMode"], "continue");
            assert_eq!(row["rlnSchemeJobHasStarted"], "0");
        }
    }

    #[test]
    fn test_rewrite_job_star_replaces_command_and_strips_aliases() {
        let text = r#"
data_job

_rlnJobTypeLabel    relion.external
_rlnJobIsContinue   0
_rlnJobIsTomo       1

data_joboptions_values

loop_
_rlnJobOptionVariable #1
_rlnJobOptionValue #2
fn_exe    "old wrapper call"
in_mic    "Schemes/warp_tomo_prep/import_movies/tilt_series.star"
param1_label    angpix
param1_value    1.35
param10_value    2
other_args    "--legacy"
do_queue    Yes
"#;
        let mut doc = StarDocument::parse(text).unwrap();
        rewrite_job_star(&mut doc, "apptainer exec img bash -c 'cmd'", "warp_tomo_prep", "scheme_demo");

        let options = doc.block("joboptions_values").unwrap();
        let rows = options.row_maps();
        let get = |name: &str| -> Option<String> {
            rows.iter()
                .find(|r| r["rlnJobOptionVariable"] == name)
                .map(|r| r["rlnJobOptionValue"].to_string())
        };

        assert_eq!(get("fn_exe").as_deref(), Some("apptainer exec img bash -c 'cmd'"));
        assert_eq!(get("other_args").as_deref(), Some(""));
        assert_eq!(get("param1_label"), None);
        assert_eq!(get("param1_value"), None);
        assert_eq!(get("param10_value"), None);
        assert_eq!(
            get("in_mic").as_deref(),
            Some("Schemes/scheme_demo/import_movies/tilt_series.star")
        );
        assert_eq!(get("do_queue").as_deref(), Some("Yes"));
    }

    #[test]
    fn test_rewrite_inserts_fn_exe_when_absent() {
        let text = "data_joboptions_values\n\nloop_\n_rlnJobOptionVariable #1\n_rlnJobOptionValue #2\ndo_queue    No\n";
        let mut doc = StarDocument::parse(text).unwrap();
        rewrite_job_star(&mut doc, "cmd", "t", "s");
        let rows = doc.block("joboptions_values").unwrap().row_maps();
        assert!(rows.iter().any(|r| r["rlnJobOptionVariable"] == "fn_exe" && r["rlnJobOptionValue"] == "cmd"));
    }

    #[test]
    fn test_param_alias_detection() {
        assert!(is_param_alias("param1_label"));
        assert!(is_param_alias("param12_value"));
        assert!(!is_param_alias("param_label"));
        assert!(!is_param_alias("parameter_value"));
        assert!(!is_param_alias("param3_other"));
    }

    #[test]
    fn test_materialization_is_deterministic() {
        let a = scheme_star_document("scheme_demo", &[JobKind::ImportMovies, JobKind::TsCtf]);
        let b = scheme_star_document("scheme_demo", &[JobKind::ImportMovies, JobKind::TsCtf]);
        assert_eq!(a.to_star_string(), b.to_star_string());
    }
}
