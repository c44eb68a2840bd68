//! Project layout creation and raw-data import.
//!
//! A project directory holds `{Schemes,Logs,frames,mdoc,qsub}`. Import
//! never moves data: movies are symlinked into `frames/` under a
//! project-unique prefix and the session metadata is rewritten to match,
//! with a provenance line recording the original source so repeated
//! imports are detected.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::SlurmDefaults;
use crate::error::{CoreError, CoreResult};
use crate::mdoc::{expand_glob, glob_parent, MdocFile};

/// Header key recording where an imported mdoc came from.
pub const ROOT_MDOC_KEY: &str = "CryoBoost_RootMdocPath";

/// Marker file the pipeliner drops in a job directory on success.
pub const JOB_SUCCESS_MARKER: &str = "RELION_JOB_EXIT_SUCCESS";

/// What data import did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Mdoc files rewritten into `mdoc/`.
    pub imported: usize,
    /// Mdoc files already imported from the same source, left untouched.
    pub skipped: usize,
    /// Movies referenced by metadata but absent on disk.
    pub missing_movies: Vec<String>,
}

/// Create the project directory skeleton and the populated qsub script.
///
/// Fails with `ProjectExists` when the root already exists.
pub fn create_layout(
    project_root: &Path,
    qsub_template: &Path,
    slurm: &SlurmDefaults,
) -> CoreResult<()> {
    if project_root.exists() {
        return Err(CoreError::ProjectExists {
            path: project_root.to_path_buf(),
        });
    }
    for sub in ["Schemes", "Logs", "frames", "mdoc", "qsub"] {
        let dir = project_root.join(sub);
        std::fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;
    }
    write_qsub_script(project_root, qsub_template, slurm)?;
    info!("project layout created at {}", project_root.display());
    Ok(())
}

/// Copy the qsub template into `<root>/qsub/qsub.sh`, substituting the
/// cluster-defaults placeholders. The pipeliner substitutes the remaining
/// `XXXoutfileXXX`/`XXXerrfileXXX`/`XXXcommandXXX` tokens at dispatch time.
pub fn write_qsub_script(
    project_root: &Path,
    qsub_template: &Path,
    slurm: &SlurmDefaults,
) -> CoreResult<()> {
    let template = std::fs::read_to_string(qsub_template)
        .map_err(|e| CoreError::io(qsub_template, e))?;

    let replacements = [
        ("XXXextra1XXX", slurm.nodes.to_string()),
        ("XXXextra2XXX", slurm.ntasks_per_node.to_string()),
        ("XXXextra3XXX", slurm.partition.clone()),
        ("XXXextra4XXX", slurm.gpu_count().to_string()),
        ("XXXextra5XXX", slurm.mem.clone()),
        ("XXXthreadsXXX", slurm.cpus_per_task.to_string()),
    ];
    let mut content = template;
    for (placeholder, value) in replacements {
        content = content.replace(placeholder, &value);
    }

    let target = project_root.join("qsub").join("qsub.sh");
    std::fs::write(&target, content).map_err(|e| CoreError::io(&target, e))?;
    Ok(())
}

/// Import raw data: symlink movies under the import prefix and rewrite the
/// session metadata into `mdoc/`.
///
/// Duplicate detection is a pre-pass over every matching mdoc; if any
/// collision with a different recorded source is found, nothing is
/// written and `frames/` and `mdoc/` stay untouched.
pub fn import_data(
    project_root: &Path,
    movies_glob: &str,
    mdocs_glob: &str,
    import_prefix: &str,
) -> CoreResult<ImportReport> {
    let mdoc_sources = expand_glob(mdocs_glob).map_err(|reason| CoreError::BadGlob {
        pattern: mdocs_glob.to_string(),
        reason,
    })?;
    if mdoc_sources.is_empty() {
        return Err(CoreError::BadGlob {
            pattern: mdocs_glob.to_string(),
            reason: "no session metadata files matched".to_string(),
        });
    }

    let mdoc_dir = project_root.join("mdoc");
    let frames_dir = project_root.join("frames");
    let movies_dir = glob_parent(movies_glob);

    // Pre-pass: reject the whole import before touching anything.
    let mut pending: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut skipped = 0usize;
    for source in &mdoc_sources {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let target = mdoc_dir.join(format!("{import_prefix}{name}"));
        if target.exists() {
            let existing = std::fs::read_to_string(&target)
                .ok()
                .map(|text| MdocFile::parse(&text))
                .and_then(|file| file.header_value(ROOT_MDOC_KEY));
            let canonical = canonicalize_lossy(source);
            match existing {
                Some(recorded) if recorded == canonical => {
                    skipped += 1;
                    continue;
                }
                Some(recorded) => {
                    return Err(CoreError::DuplicateImport {
                        mdoc: target.display().to_string(),
                        existing: recorded,
                    });
                }
                None => {
                    return Err(CoreError::DuplicateImport {
                        mdoc: target.display().to_string(),
                        existing: "<no recorded source>".to_string(),
                    });
                }
            }
        }
        pending.push((source.clone(), target));
    }

    let mut report = ImportReport {
        skipped,
        ..Default::default()
    };

    for (source, target) in pending {
        let text =
            std::fs::read_to_string(&source).map_err(|e| CoreError::io(&source, e))?;
        let mut file = MdocFile::parse(&text);

        for section in &mut file.sections {
            let Some(subframe) = section.get("SubFramePath").map(str::to_string) else {
                continue;
            };
            let original_name = movie_basename(&subframe);
            let prefixed = format!("{import_prefix}{original_name}");
            section.set("SubFramePath", prefixed.clone());

            let movie_source = movies_dir.join(&original_name);
            let link = frames_dir.join(&prefixed);
            if !movie_source.exists() {
                warn!("source movie not found: {}", movie_source.display());
                report.missing_movies.push(original_name);
                continue;
            }
            if !link.exists() {
                let resolved = canonicalize_lossy(&movie_source);
                symlink(Path::new(&resolved), &link)?;
            }
        }

        file.append_header(ROOT_MDOC_KEY, &canonicalize_lossy(&source));
        std::fs::write(&target, file.to_mdoc_string())
            .map_err(|e| CoreError::io(&target, e))?;
        report.imported += 1;
    }

    info!(
        imported = report.imported,
        skipped = report.skipped,
        "data import finished for {}",
        project_root.display()
    );
    Ok(report)
}

/// Basename of a `SubFramePath` value, which is typically a Windows path
/// written by the acquisition PC.
fn movie_basename(subframe_path: &str) -> String {
    subframe_path
        .replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn canonicalize_lossy(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path) -> CoreResult<()> {
    std::os::unix::fs::symlink(source, link).map_err(|e| CoreError::io(link, e))
}

#[cfg(not(unix))]
fn symlink(source: &Path, link: &Path) -> CoreResult<()> {
    std::fs::copy(source, link)
        .map(|_| ())
        .map_err(|e| CoreError::io(link, e))
}
