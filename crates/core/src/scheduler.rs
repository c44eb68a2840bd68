//! Cluster scheduler client.
//!
//! The orchestrator's only scheduler interactions are introspection
//! (which jobs of ours are alive) and cancellation during an abort. Both
//! go through the [`SchedulerClient`] trait so tests can substitute a
//! mock; the real implementation shells out to the SLURM client tools
//! with a bounded timeout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Bound on any single scheduler shell call.
pub const SCHEDULER_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// One job as reported by the scheduler queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerJob {
    pub job_id: String,
    pub name: String,
    pub state: String,
    /// The job's working directory; pipeliner-submitted jobs run inside
    /// the project tree, which is how we find ours.
    pub workdir: String,
}

/// Scheduler operations the orchestrator needs.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// List the current user's jobs.
    async fn list_jobs(&self) -> CoreResult<Vec<SchedulerJob>>;

    /// Cancel one job by scheduler id.
    async fn cancel(&self, job_id: &str) -> CoreResult<()>;
}

/// SLURM implementation shelling out to `squeue`/`scancel`.
pub struct SlurmClient {
    timeout: Duration,
}

impl Default for SlurmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SlurmClient {
    pub fn new() -> SlurmClient {
        SlurmClient {
            timeout: SCHEDULER_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> SlurmClient {
        SlurmClient { timeout }
    }

    async fn run(&self, program: &str, args: &[&str]) -> CoreResult<String> {
        let command_line = format!("{program} {}", args.join(" "));
        debug!("scheduler call: {command_line}");

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::Subprocess {
                command: command_line.clone(),
                stderr: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| CoreError::Subprocess {
                command: command_line.clone(),
                stderr: e.to_string(),
            })?,
            Err(_) => {
                return Err(CoreError::Timeout {
                    command: command_line,
                });
            }
        };

        if !output.status.success() {
            return Err(CoreError::Subprocess {
                command: command_line,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SchedulerClient for SlurmClient {
    async fn list_jobs(&self) -> CoreResult<Vec<SchedulerJob>> {
        let stdout = self
            .run("squeue", &["--me", "-h", "-o", "%i|%j|%T|%Z"])
            .await?;
        Ok(parse_squeue(&stdout))
    }

    async fn cancel(&self, job_id: &str) -> CoreResult<()> {
        self.run("scancel", &[job_id]).await.map(|_| ())
    }
}

/// Parse `squeue -h -o "%i|%j|%T|%Z"` output.
fn parse_squeue(stdout: &str) -> Vec<SchedulerJob> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('|').collect();
            if parts.len() < 4 {
                return None;
            }
            Some(SchedulerJob {
                job_id: parts[0].trim().to_string(),
                name: parts[1].trim().to_string(),
                state: parts[2].trim().to_string(),
                workdir: parts[3].trim().to_string(),
            })
        })
        .collect()
}

/// Pick the scheduler job dispatched from inside the given project tree.
pub fn find_job_in_tree<'a>(
    jobs: &'a [SchedulerJob],
    project_root: &str,
) -> Option<&'a SchedulerJob> {
    jobs.iter()
        .find(|job| job.state == "RUNNING" && job.workdir.starts_with(project_root))
        .or_else(|| jobs.iter().find(|job| job.workdir.starts_with(project_root)))
}
