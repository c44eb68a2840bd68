//! Progress watcher: the bridge from the pipeliner's processes file to
//! UI subscribers.
//!
//! One watch per opened project. A ticker reads `default_pipeline.star`,
//! derives per-kind statuses, and publishes a delta whenever any job's
//! status or the aggregate counters change. The pipeliner owns the file
//! and may rename or truncate it mid-read; unreadable ticks are silently
//! retried, and only a sustained failure streak is surfaced as a warning
//! event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cb_protocol::{ProgressEvent, ProgressSnapshot};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::processes;
use crate::state::StateStore;

/// Poll cadence; the spec allows up to 5 s.
pub const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive failed ticks before one warning event is emitted.
const WARN_AFTER_FAILURES: u32 = 5;

/// Handle to one project's watch task. Dropping it cancels the watch.
pub struct ProgressWatcher {
    handle: JoinHandle<()>,
}

impl ProgressWatcher {
    /// Start watching a project directory.
    pub fn spawn(
        project_root: PathBuf,
        store: Arc<StateStore>,
        events: broadcast::Sender<ProgressEvent>,
    ) -> ProgressWatcher {
        let handle = tokio::spawn(watch_loop(project_root, store, events, WATCH_INTERVAL));
        ProgressWatcher { handle }
    }

    /// Cadence override for tests.
    pub fn spawn_with_interval(
        project_root: PathBuf,
        store: Arc<StateStore>,
        events: broadcast::Sender<ProgressEvent>,
        interval: Duration,
    ) -> ProgressWatcher {
        let handle = tokio::spawn(watch_loop(project_root, store, events, interval));
        ProgressWatcher { handle }
    }

    /// Stop the watch.
    pub fn close(&self) {
        self.handle.abort();
    }
}

impl Drop for ProgressWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn watch_loop(
    project_root: PathBuf,
    store: Arc<StateStore>,
    events: broadcast::Sender<ProgressEvent>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last: Option<ProgressSnapshot> = None;
    let mut failures: u32 = 0;

    loop {
        ticker.tick().await;

        let rows = match processes::read_processes(&project_root) {
            Ok(rows) => {
                failures = 0;
                rows
            }
            Err(e) => {
                failures += 1;
                debug!("processes file unreadable (tick {failures}): {e}");
                if failures == WARN_AFTER_FAILURES {
                    let _ = events.send(ProgressEvent::WatcherWarning {
                        message: format!(
                            "processes file unreadable for {failures} consecutive ticks"
                        ),
                    });
                }
                continue;
            }
        };

        let Ok(project) = store.snapshot().await else {
            continue;
        };

        let jobs = processes::derive_statuses(&project_root, &project.selected_jobs, &rows);
        let counters = processes::counters(&rows);
        let snapshot = ProgressSnapshot {
            complete: ProgressSnapshot::compute_complete(&counters),
            jobs: jobs.clone(),
            counters,
        };

        if last.as_ref() != Some(&snapshot) {
            if let Err(e) = store.apply_statuses(&jobs).await {
                warn!("could not apply derived statuses: {e}");
            }
            let _ = events.send(ProgressEvent::Progress(snapshot.clone()));
            last = Some(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdoc::DetectedParams;
    use cb_protocol::{JobKind, JobStatus};

    const PROCESSES: &str = r#"
data_pipeline_processes

loop_
_rlnPipeLineProcessName #1
_rlnPipeLineProcessAlias #2
_rlnPipeLineProcessTypeLabel #3
_rlnPipeLineProcessStatusLabel #4
Import/job001/    Schemes/scheme_demo/import_movies    relion.importtomo    Running
"#;

    async fn prepared_store(root: &std::path::Path) -> Arc<StateStore> {
        let store = Arc::new(StateStore::new());
        store
            .create_project(
                "demo",
                root,
                "",
                "",
                &[JobKind::ImportMovies, JobKind::FsMotionAndCtf],
                &DetectedParams::default(),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_emits_delta_on_status_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = prepared_store(dir.path()).await;
        let (tx, mut rx) = broadcast::channel(16);
        let _watcher = ProgressWatcher::spawn_with_interval(
            dir.path().to_path_buf(),
            Arc::clone(&store),
            tx,
            Duration::from_millis(20),
        );

        // No file yet: silence.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());

        std::fs::write(dir.path().join(processes::PROCESSES_FILE), PROCESSES).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event within timeout")
            .unwrap();
        match event {
            ProgressEvent::Progress(snapshot) => {
                assert_eq!(snapshot.jobs[&JobKind::ImportMovies], JobStatus::Running);
                assert_eq!(snapshot.jobs[&JobKind::FsMotionAndCtf], JobStatus::Scheduled);
                assert_eq!(snapshot.counters.running, 1);
                assert!(!snapshot.complete);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Store picked up the derived status and froze the record.
        let project = store.snapshot().await.unwrap();
        assert_eq!(
            project.jobs[&JobKind::ImportMovies].execution_status,
            JobStatus::Running
        );

        // Unchanged file: no further events.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completion_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = prepared_store(dir.path()).await;
        let (tx, mut rx) = broadcast::channel(16);
        let _watcher = ProgressWatcher::spawn_with_interval(
            dir.path().to_path_buf(),
            Arc::clone(&store),
            tx,
            Duration::from_millis(20),
        );

        let done = PROCESSES.replace("Running", "Succeeded");
        std::fs::write(dir.path().join(processes::PROCESSES_FILE), done).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event within timeout")
            .unwrap();
        match event {
            ProgressEvent::Progress(snapshot) => {
                assert!(snapshot.complete);
                assert_eq!(snapshot.counters.succeeded, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
