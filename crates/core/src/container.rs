//! Container-executor command wrapping.
//!
//! Tools declared as containerized in the configuration have their raw
//! commands rewritten into a single container-runtime invocation. Tools
//! declared as binaries pass through unchanged. The wrapper never checks
//! that the image actually contains the tool; the tool → image mapping is
//! the config loader's contract.

use std::path::{Path, PathBuf};

use cb_protocol::ToolTag;

use crate::config::{AppConfig, ToolExecution};

/// Container-runtime environment variables that a parent container
/// execution would leak into a nested launch. Cleared up front so launches
/// from inside the orchestrator's own container stay clean.
const SCRUBBED_ENV_VARS: [&str; 7] = [
    "LD_PRELOAD",
    "SINGULARITY_BIND",
    "SINGULARITY_BINDPATH",
    "APPTAINER_BIND",
    "APPTAINER_BINDPATH",
    "SINGULARITYENV_APPEND_PATH",
    "APPTAINERENV_APPEND_PATH",
];

/// Paths resolved per wrapped command.
#[derive(Debug, Clone)]
pub struct BindContext {
    pub project_root: PathBuf,
    pub project_base: PathBuf,
    /// Per-command extra binds from the caller (data directories etc.).
    pub extra_binds: Vec<PathBuf>,
}

impl BindContext {
    pub fn new(project_root: impl Into<PathBuf>, project_base: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            project_base: project_base.into(),
            extra_binds: Vec::new(),
        }
    }

    pub fn with_extra_binds(mut self, extra: impl IntoIterator<Item = PathBuf>) -> Self {
        self.extra_binds.extend(extra);
        self
    }
}

/// Rewrites raw tool commands into container-runtime invocations.
pub struct ContainerWrapper<'a> {
    config: &'a AppConfig,
    home_dir: PathBuf,
}

impl<'a> ContainerWrapper<'a> {
    pub fn new(config: &'a AppConfig) -> Self {
        let home_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));
        Self { config, home_dir }
    }

    /// Override the home directory (tests).
    pub fn with_home_dir(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_dir = home.into();
        self
    }

    /// Wrap `command` for the given tool.
    ///
    /// Returns the command unchanged when the tool runs as a host binary
    /// or has no configuration entry.
    pub fn wrap(&self, tool: ToolTag, command: &str, ctx: &BindContext) -> String {
        let Some(tool_config) = self.config.tool(tool.as_str()) else {
            return command.to_string();
        };
        if tool_config.execution() != Some(ToolExecution::Container) {
            return command.to_string();
        }

        let runtime = &self.config.container.runtime;
        let image = &tool_config.path;

        let mut parts: Vec<String> = Vec::new();
        parts.push(format!("unset {};", SCRUBBED_ENV_VARS.join(" ")));
        parts.push(runtime.clone());
        parts.push("exec".to_string());
        if gpu_tool(tool) {
            parts.push("--nv".to_string());
        }
        for bind in self.binds(ctx) {
            parts.push("-B".to_string());
            parts.push(bind);
        }
        parts.push(image.clone());
        parts.push("bash".to_string());
        parts.push("-c".to_string());
        parts.push(quote_single(&self.inner_command(tool, command)));

        parts.join(" ")
    }

    /// The inner command executed by the image's shell. The RELION image
    /// needs its interpreter environment pinned: a host Python environment
    /// leaking in breaks the pipeliner's own scripts.
    fn inner_command(&self, tool: ToolTag, command: &str) -> String {
        if tool == ToolTag::Relion {
            let mut path = self.config.container.relion_path_env.clone();
            let scheduler_bin = Path::new(&self.config.container.scheduler_bin_dir);
            if scheduler_bin.is_dir() {
                path.push(':');
                path.push_str(&self.config.container.scheduler_bin_dir);
            }
            format!("unset PYTHONPATH PYTHONHOME; export PATH={path}; {command}")
        } else {
            command.to_string()
        }
    }

    /// Assemble the bind list: unconditional locations first, then the
    /// existence-gated cluster integration paths, then caller extras.
    /// Order-preserving dedup keeps the line stable.
    fn binds(&self, ctx: &BindContext) -> Vec<String> {
        let mut binds: Vec<String> = Vec::new();
        let mut push = |bind: String| {
            if !binds.contains(&bind) {
                binds.push(bind);
            }
        };

        push("/tmp".to_string());
        push(self.home_dir.display().to_string());
        push(ctx.project_root.display().to_string());
        push(ctx.project_base.display().to_string());

        let container = &self.config.container;
        for dir in [&container.scheduler_bin_dir, &container.scheduler_lib_dir, &container.munge_socket_dir] {
            if Path::new(dir).is_dir() {
                push(dir.clone());
            }
        }
        for file in ["/etc/passwd", "/etc/group"] {
            if Path::new(file).is_file() {
                push(format!("{file}:{file}:ro"));
            }
        }

        for extra in &ctx.extra_binds {
            push(extra.display().to_string());
        }
        binds
    }
}

fn gpu_tool(tool: ToolTag) -> bool {
    !matches!(tool, ToolTag::Relion)
}

/// Single-quote a string for the shell, escaping embedded quotes.
pub fn quote_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
