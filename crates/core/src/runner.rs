//! Pipeline runner: supervised execution of the downstream pipeliner.
//!
//! One runner per project. The pipeliner is spawned in its own session
//! with captured stdio; a monitor task tees both streams to the project
//! log and drives the state machine:
//!
//! | state      | entry                         | transitions                      |
//! |------------|-------------------------------|----------------------------------|
//! | `Idle`     | no supervised subprocess      | `start → Starting`               |
//! | `Starting` | spawned, no output yet        | `Running` on first stdout;       |
//! |            |                               | `Failed` on early exit           |
//! | `Running`  | subprocess alive              | `Stopping` on abort;             |
//! |            |                               | `Completed`/`Failed` on exit     |
//! | `Stopping` | abort signal sent             | `Idle` after reap                |
//! | `Completed`/`Failed` | reaped              | `start → Starting` (new run)     |

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use cb_protocol::ProgressEvent;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::container::{BindContext, ContainerWrapper};
use crate::error::{CoreError, CoreResult};
use crate::processes;
use crate::project::JOB_SUCCESS_MARKER;
use crate::scheduler::{find_job_in_tree, SchedulerClient};
use crate::state::StateStore;

/// Lock directory the pipeliner maintains under the scheme while running.
pub const PIPELINER_LOCK_DIR: &str = ".relion_lock";

/// Runner lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
}

struct RunnerInner {
    state: RunnerState,
    pid: Option<u32>,
}

/// Supervises one project's pipeliner subprocess.
pub struct PipelineRunner {
    config: Arc<AppConfig>,
    scheduler: Arc<dyn SchedulerClient>,
    inner: Arc<Mutex<RunnerInner>>,
    events: broadcast::Sender<ProgressEvent>,
}

impl PipelineRunner {
    pub fn new(
        config: Arc<AppConfig>,
        scheduler: Arc<dyn SchedulerClient>,
        events: broadcast::Sender<ProgressEvent>,
    ) -> PipelineRunner {
        PipelineRunner {
            config,
            scheduler,
            inner: Arc::new(Mutex::new(RunnerInner {
                state: RunnerState::Idle,
                pid: None,
            })),
            events,
        }
    }

    pub async fn state(&self) -> RunnerState {
        self.inner.lock().await.state
    }

    /// Spawn the pipeliner for an already-materialized scheme.
    ///
    /// Ordering contract: the caller has written the snapshot and the
    /// scheme before this is invoked. Returns the subprocess pid.
    pub async fn start(
        &self,
        store: Arc<StateStore>,
        project_root: &Path,
        scheme_name: &str,
        extra_binds: Vec<PathBuf>,
    ) -> CoreResult<u32> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                RunnerState::Starting | RunnerState::Running | RunnerState::Stopping => {
                    return Err(CoreError::PipelineActive);
                }
                _ => {}
            }
            inner.state = RunnerState::Starting;
        }

        let raw = format!("relion_schemer --scheme {scheme_name} --run --verb 2");
        let base = project_root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let ctx = BindContext::new(project_root, base).with_extra_binds(extra_binds);
        let wrapper = ContainerWrapper::new(&self.config);
        let command_line = wrapper.wrap(cb_protocol::ToolTag::Relion, &raw, &ctx);

        let log_path = project_root
            .join("Logs")
            .join(format!("pipeliner_{scheme_name}.log"));

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(&command_line)
            .current_dir(project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.state = RunnerState::Failed;
                return Err(CoreError::Subprocess {
                    command: command_line,
                    stderr: e.to_string(),
                });
            }
        };

        let pid = child.id().unwrap_or_default();
        {
            let mut inner = self.inner.lock().await;
            inner.pid = Some(pid);
        }
        store.set_pipeline_active(true).await;
        info!(pid, scheme = scheme_name, "pipeliner started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        tokio::spawn(async move {
            monitor(child, stdout, stderr, log_path, inner, store, events).await;
        });

        Ok(pid)
    }

    /// Cooperative abort: terminate the pipeliner, cancel the running
    /// scheduler job, mark its row failed unless the success marker
    /// exists, and clear the scheme lock. All four steps are best-effort
    /// and idempotent; errors are logged and swallowed.
    pub async fn abort(&self, project_root: &Path, scheme_name: &str) -> CoreResult<()> {
        let pid = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                RunnerState::Starting | RunnerState::Running | RunnerState::Stopping => {}
                _ => return Err(CoreError::NotRunning),
            }
            inner.state = RunnerState::Stopping;
            inner.pid
        };

        if let Some(pid) = pid {
            terminate_process_group(pid).await;
        }

        let running = processes::read_processes(project_root)
            .ok()
            .and_then(|rows| processes::find_running(&rows).cloned());

        if let Some(row) = &running {
            match self.scheduler.list_jobs().await {
                Ok(jobs) => {
                    let root = project_root.display().to_string();
                    if let Some(job) = find_job_in_tree(&jobs, &root) {
                        if let Err(e) = self.scheduler.cancel(&job.job_id).await {
                            warn!("abort: scheduler cancel failed: {e}");
                        }
                    }
                }
                Err(e) => warn!("abort: scheduler listing failed: {e}"),
            }

            let job_dir = project_root.join(row.name.trim_end_matches('/'));
            if !job_dir.join(JOB_SUCCESS_MARKER).exists() {
                if let Err(e) = processes::rewrite_status(project_root, &row.name, "Failed") {
                    warn!("abort: could not rewrite process status: {e}");
                }
            }
        }

        let lock_dir = project_root
            .join("Schemes")
            .join(scheme_name)
            .join(PIPELINER_LOCK_DIR);
        if lock_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&lock_dir) {
                warn!("abort: could not remove lock dir {}: {e}", lock_dir.display());
            }
        }

        info!(scheme = scheme_name, "abort sequence issued");
        Ok(())
    }

    /// Remove the pipeliner's lock directory without touching anything
    /// else. Explicit user operation for a crashed pipeliner.
    pub async fn unlock(&self, project_root: &Path, scheme_name: &str) -> CoreResult<()> {
        let lock_dir = project_root
            .join("Schemes")
            .join(scheme_name)
            .join(PIPELINER_LOCK_DIR);
        if lock_dir.exists() {
            std::fs::remove_dir_all(&lock_dir).map_err(|e| CoreError::io(&lock_dir, e))?;
        }
        Ok(())
    }

    /// Synchronous `--reset`: rewind the scheme's current node back to the
    /// initial WAIT state. No supervision needed.
    pub async fn reset(&self, project_root: &Path, scheme_name: &str) -> CoreResult<()> {
        {
            let inner = self.inner.lock().await;
            if matches!(
                inner.state,
                RunnerState::Starting | RunnerState::Running | RunnerState::Stopping
            ) {
                return Err(CoreError::PipelineActive);
            }
        }

        let raw = format!("relion_schemer --scheme {scheme_name} --reset");
        let base = project_root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let ctx = BindContext::new(project_root, base);
        let wrapper = ContainerWrapper::new(&self.config);
        let command_line = wrapper.wrap(cb_protocol::ToolTag::Relion, &raw, &ctx);

        run_bounded(&command_line, project_root, Duration::from_secs(120)).await
    }
}

/// Pump the child's stdio to the log file and drive state transitions.
async fn monitor(
    mut child: tokio::process::Child,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    log_path: PathBuf,
    inner: Arc<Mutex<RunnerInner>>,
    store: Arc<StateStore>,
    events: broadcast::Sender<ProgressEvent>,
) {
    let mut log = match tokio::fs::File::create(&log_path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("cannot open pipeliner log {}: {e}", log_path.display());
            None
        }
    };

    let mut lines = stdio_lines(stdout, stderr);
    while let Some(line) = lines.next().await {
        if line.from_stdout {
            let mut inner = inner.lock().await;
            if inner.state == RunnerState::Starting {
                inner.state = RunnerState::Running;
            }
        }
        if let Some(log) = log.as_mut() {
            let _ = log.write_all(line.text.as_bytes()).await;
            let _ = log.write_all(b"\n").await;
        }
    }

    let status = child.wait().await;
    let exit_code = status.as_ref().ok().and_then(|s| s.code());

    {
        let mut inner = inner.lock().await;
        inner.pid = None;
        inner.state = match inner.state {
            RunnerState::Stopping => RunnerState::Idle,
            _ if exit_code == Some(0) => RunnerState::Completed,
            _ => RunnerState::Failed,
        };
        info!(?exit_code, state = ?inner.state, "pipeliner exited");
    }

    store.set_pipeline_active(false).await;
    let _ = events.send(ProgressEvent::PipelineFinished { exit_code });
}

struct StdioLine {
    text: String,
    from_stdout: bool,
}

/// Merge the child's stdout and stderr into one line stream. The pumps
/// terminate when the child closes its end of each pipe.
fn stdio_lines(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) -> Pin<Box<dyn Stream<Item = StdioLine> + Send>> {
    let stream = async_stream::stream! {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<StdioLine>(64);

        if let Some(stdout) = stdout {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    if tx.send(StdioLine { text, from_stdout: true }).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = stderr {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(text)) = lines.next_line().await {
                    if tx.send(StdioLine { text, from_stdout: false }).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        while let Some(line) = rx.recv().await {
            yield line;
        }
    };
    Box::pin(stream)
}

/// Send SIGTERM to the pipeliner's process group.
async fn terminate_process_group(pid: u32) {
    let target = format!("-{pid}");
    match Command::new("kill").args(["-TERM", "--", &target]).status().await {
        Ok(status) if status.success() => {}
        Ok(_) => warn!("kill -TERM reported failure for group {pid}"),
        Err(e) => warn!("could not signal process group {pid}: {e}"),
    }
}

/// Run one shell line with a bound, capturing stderr for the error path.
async fn run_bounded(command_line: &str, cwd: &Path, timeout: Duration) -> CoreResult<()> {
    let mut child = Command::new("bash")
        .arg("-c")
        .arg(command_line)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CoreError::Subprocess {
            command: command_line.to_string(),
            stderr: e.to_string(),
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| CoreError::Subprocess {
            command: command_line.to_string(),
            stderr: e.to_string(),
        })?,
        Err(_) => {
            return Err(CoreError::Timeout {
                command: command_line.to_string(),
            });
        }
    };

    if !output.status.success() {
        return Err(CoreError::Subprocess {
            command: command_line.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}
