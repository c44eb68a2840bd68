//! Configuration file loader.
//!
//! Loads one YAML document, then validates the contracts the rest of the
//! core relies on: the project base is set, every tool has an unambiguous
//! execution mode, and every container image path resolves to a file.

use std::path::Path;

use tracing::info;

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::models::{AppConfig, ToolExecution};

/// Load and validate the configuration document.
///
/// # Arguments
///
/// * `path` - Path to the YAML configuration file
///
/// # Errors
///
/// Returns `ConfigError` if:
/// - The file cannot be read or parsed
/// - `local.default_project_base` is missing or empty
/// - Any tool sets both or neither of `binary`/`container`
/// - Any containerized tool's image path does not exist
pub fn load_config(path: &Path) -> ConfigResult<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    let config: AppConfig =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlParse {
            path: path.to_path_buf(),
            source,
        })?;

    validate(&config)?;

    info!(
        tools = config.tools.len(),
        presets = config.microscopes.len(),
        "configuration loaded from {}",
        path.display()
    );
    Ok(config)
}

/// Validate an already-parsed configuration.
///
/// Split out so tests can exercise the contracts without touching disk.
pub fn validate(config: &AppConfig) -> ConfigResult<()> {
    if config.local.default_project_base.is_empty() {
        return Err(ConfigError::MissingKey {
            key: "local.default_project_base".to_string(),
        });
    }

    if config.local.dose_per_tilt_factor <= 0.0 {
        return Err(ConfigError::Invalid {
            reason: "local.dose_per_tilt_factor must be positive".to_string(),
        });
    }

    for (name, tool) in &config.tools {
        match tool.execution() {
            None => {
                return Err(ConfigError::AmbiguousTool { tool: name.clone() });
            }
            Some(ToolExecution::Container) => {
                let image = Path::new(&tool.path);
                if !image.is_file() {
                    return Err(ConfigError::ContainerImageMissing {
                        tool: name.clone(),
                        path: image.to_path_buf(),
                    });
                }
            }
            Some(ToolExecution::Binary) => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("config.yaml");
        fs::write(&path, body).expect("failed to write config");
        path
    }

    #[test]
    fn test_load_config_acceptance() {
        let dir = tempdir().expect("failed to create temp dir");
        let image = dir.path().join("warp.sif");
        fs::write(&image, b"sif").unwrap();

        let body = format!(
            r#"
local:
  default_project_base: {base}
  default_movies_glob: "/data/*.eer"
  dose_per_tilt_factor: 1.5
slurm_defaults:
  partition: g
  gres: "gpu:2"
  mem: 64G
tools:
  warptools:
    container: true
    path: {image}
  relion_import:
    binary: true
    path: /usr/bin/relion_import
microscopes:
  Krios_G3:
    pixel_size_angstrom: 1.35
    acceleration_voltage_kv: 300
aliases:
  - ["angpix", "Pixel size"]
"#,
            base = dir.path().display(),
            image = image.display()
        );
        let path = write_config(dir.path(), &body);

        let config = load_config(&path).expect("failed to load config");
        assert_eq!(config.slurm_defaults.partition, "g");
        assert_eq!(config.slurm_defaults.gpu_count(), 2);
        assert_eq!(
            config.tool("warptools").unwrap().execution(),
            Some(ToolExecution::Container)
        );
        assert_eq!(
            config.tool("relion_import").unwrap().execution(),
            Some(ToolExecution::Binary)
        );
        assert_eq!(config.microscopes["Krios_G3"].spherical_aberration_mm, 2.7);
        assert_eq!(config.aliases[0].0, "angpix");
        assert_eq!(config.local.dose_per_tilt_factor, 1.5);
    }

    #[test]
    fn test_missing_project_base_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"
local:
  default_project_base: ""
tools: {}
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { .. }));
    }

    #[test]
    fn test_tool_with_both_modes_is_fatal() {
        let dir = tempdir().unwrap();
        let body = format!(
            r#"
local:
  default_project_base: {base}
tools:
  warptools:
    binary: true
    container: true
    path: /img/warp.sif
"#,
            base = dir.path().display()
        );
        let path = write_config(dir.path(), &body);
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousTool { tool } if tool == "warptools"));
    }

    #[test]
    fn test_tool_with_neither_mode_is_fatal() {
        let dir = tempdir().unwrap();
        let body = format!(
            r#"
local:
  default_project_base: {base}
tools:
  pytom:
    path: /img/pytom.sif
"#,
            base = dir.path().display()
        );
        let path = write_config(dir.path(), &body);
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousTool { .. }));
    }

    #[test]
    fn test_missing_container_image_is_fatal() {
        let dir = tempdir().unwrap();
        let body = format!(
            r#"
local:
  default_project_base: {base}
tools:
  warptools:
    container: true
    path: {base}/missing.sif
"#,
            base = dir.path().display()
        );
        let path = write_config(dir.path(), &body);
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ContainerImageMissing { .. }));
    }

    #[test]
    fn test_invalid_yaml_is_fatal() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), "local: [not: valid");
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::YamlParse { .. }));
    }
}
