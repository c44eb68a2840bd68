//! Per-job-kind command construction.
//!
//! A registry keyed by [`JobKind`] maps each kind to a builder function.
//! Non-driver kinds assemble the raw tool invocation from the global
//! parameter records; driver kinds return a bootstrap line that re-reads
//! the project snapshot on the compute node and does its own command
//! shaping there. No branching chains: dispatch is a table lookup.

use std::path::Path;

use cb_protocol::{JobKind, JobRecord, JobParams, Project};

use crate::error::{CoreError, CoreResult};

/// Paths resolved at build time and handed to non-driver builders.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    /// Project-relative movie glob, e.g. `./frames/*.eer`.
    pub movies_glob: String,
    /// Project-relative mdoc glob.
    pub mdocs_glob: String,
}

impl ResolvedPaths {
    /// Resolve the project-relative globs, detecting the imported frame
    /// extension from what actually landed in `frames/`.
    pub fn for_project_root(project_root: &Path) -> ResolvedPaths {
        let frames = project_root.join("frames");
        let ext = ["eer", "tiff", "tif", "mrc"]
            .into_iter()
            .find(|ext| {
                std::fs::read_dir(&frames)
                    .map(|entries| {
                        entries.flatten().any(|e| {
                            e.path().extension().and_then(|x| x.to_str()) == Some(ext)
                        })
                    })
                    .unwrap_or(false)
            })
            .unwrap_or("eer");
        ResolvedPaths {
            movies_glob: format!("./frames/*.{ext}"),
            mdocs_glob: "./mdoc/*.mdoc".to_string(),
        }
    }
}

type BuilderFn = fn(&Project, &JobRecord, &ResolvedPaths) -> CoreResult<String>;

/// The kind → builder table. Driver kinds all share the bootstrap builder.
static REGISTRY: &[(JobKind, BuilderFn)] = &[
    (JobKind::ImportMovies, build_import_movies),
    (JobKind::FsMotionAndCtf, build_driver_bootstrap),
    (JobKind::TsAlignment, build_driver_bootstrap),
    (JobKind::TsCtf, build_driver_bootstrap),
    (JobKind::TsReconstruct, build_driver_bootstrap),
    (JobKind::DenoiseTrain, build_driver_bootstrap),
    (JobKind::DenoisePredict, build_driver_bootstrap),
    (JobKind::TemplateMatching, build_driver_bootstrap),
    (JobKind::ExtractCandidates, build_driver_bootstrap),
    (JobKind::SubtomoExtraction, build_driver_bootstrap),
];

/// Build the raw (unwrapped) command for one selected job.
pub fn build_command(
    kind: JobKind,
    project: &Project,
    paths: &ResolvedPaths,
) -> CoreResult<String> {
    let record = project
        .jobs
        .get(&kind)
        .ok_or(CoreError::MissingParameter {
            kind,
            field: "job record".to_string(),
        })?;
    let Some(builder) = REGISTRY.iter().find(|(k, _)| *k == kind).map(|(_, f)| *f) else {
        return Err(CoreError::MissingParameter {
            kind,
            field: "command builder".to_string(),
        });
    };
    builder(project, record, paths)
}

fn require_positive(kind: JobKind, field: &str, value: f64) -> CoreResult<f64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(CoreError::MissingParameter {
            kind,
            field: field.to_string(),
        });
    }
    Ok(value)
}

/// Trim a float for the command line: integers print bare, everything
/// else keeps its fraction.
fn fmt_num(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// `import_movies`: one shell line invoking the movie-import tool with the
/// resolved globs and the microscope/acquisition values read from the
/// global records at build time.
fn build_import_movies(
    project: &Project,
    record: &JobRecord,
    paths: &ResolvedPaths,
) -> CoreResult<String> {
    let kind = JobKind::ImportMovies;
    let microscope = &project.microscope;
    let acquisition = &project.acquisition;

    let pixel_size = require_positive(kind, "pixel_size_angstrom", microscope.pixel_size_angstrom)?;
    let voltage = require_positive(
        kind,
        "acceleration_voltage_kv",
        microscope.acceleration_voltage_kv,
    )?;
    let dose = require_positive(kind, "dose_per_tilt", acquisition.dose_per_tilt)?;

    let JobParams::ImportMovies(params) = &record.params else {
        return Err(CoreError::MissingParameter {
            kind,
            field: "params".to_string(),
        });
    };

    let mut cmd: Vec<String> = vec![
        "relion_import".to_string(),
        "--do_movies".to_string(),
        "--optics_group_name".to_string(),
        params.optics_group_name.clone(),
        "--angpix".to_string(),
        fmt_num(pixel_size),
        "--kV".to_string(),
        fmt_num(voltage),
        "--Cs".to_string(),
        fmt_num(microscope.spherical_aberration_mm),
        "--Q0".to_string(),
        fmt_num(microscope.amplitude_contrast),
        "--dose_per_tilt_image".to_string(),
        fmt_num(dose),
        "--nominal_tilt_axis_angle".to_string(),
        fmt_num(acquisition.tilt_axis_degrees),
    ];

    if acquisition.invert_defocus_hand {
        cmd.push("--invert_defocus_hand".to_string());
    }
    if params.do_at_most > 0 {
        cmd.push("--do_at_most".to_string());
        cmd.push(params.do_at_most.to_string());
    }

    cmd.push("--i".to_string());
    cmd.push(paths.mdocs_glob.clone());
    cmd.push("--mov".to_string());
    cmd.push(paths.movies_glob.clone());

    Ok(cmd.join(" "))
}

/// Driver kinds: a thin bootstrap resolved on the compute node. The qsub
/// template exports `CRBOOST_PYTHON` and `CRBOOST_SERVER_DIR`; the driver
/// re-reads `project_params.json` from the job's working directory so it
/// sees exactly the values the run snapshot froze.
fn build_driver_bootstrap(
    _project: &Project,
    record: &JobRecord,
    _paths: &ResolvedPaths,
) -> CoreResult<String> {
    let kind = record.kind();
    Ok(format!(
        "${{CRBOOST_PYTHON}} ${{CRBOOST_SERVER_DIR}}/drivers/{kind}.py --kind {kind}"
    ))
}
