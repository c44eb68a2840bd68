//! Per-project live objects.
//!
//! Each opened or created project gets one [`ProjectHandle`] bundling its
//! single-writer store, its pipeline runner, its progress watcher and the
//! broadcast channel they share. The registry hands out the same handle
//! for the same directory for the lifetime of the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cb_core::config::AppConfig;
use cb_core::runner::PipelineRunner;
use cb_core::scheduler::SchedulerClient;
use cb_core::state::StateStore;
use cb_core::watcher::ProgressWatcher;
use cb_protocol::ProgressEvent;
use tokio::sync::{broadcast, Mutex};

/// Capacity of each project's progress broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The live objects of one project.
pub struct ProjectHandle {
    pub root: PathBuf,
    pub store: Arc<StateStore>,
    pub runner: PipelineRunner,
    events: broadcast::Sender<ProgressEvent>,
    watcher: Mutex<Option<ProgressWatcher>>,
}

impl ProjectHandle {
    fn new(
        root: PathBuf,
        config: Arc<AppConfig>,
        scheduler: Arc<dyn SchedulerClient>,
    ) -> ProjectHandle {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let store = Arc::new(StateStore::new());
        let runner = PipelineRunner::new(config, scheduler, events.clone());
        ProjectHandle {
            root,
            store,
            runner,
            events,
            watcher: Mutex::new(None),
        }
    }

    /// Subscribe to this project's progress stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Start the progress watch if it is not already running.
    pub async fn ensure_watching(&self) {
        let mut watcher = self.watcher.lock().await;
        if watcher.is_none() {
            *watcher = Some(ProgressWatcher::spawn(
                self.root.clone(),
                Arc::clone(&self.store),
                self.events.clone(),
            ));
        }
    }

    /// Cancel the watch (project closed).
    pub async fn stop_watching(&self) {
        let mut watcher = self.watcher.lock().await;
        if let Some(watcher) = watcher.take() {
            watcher.close();
        }
    }
}

/// All projects this server instance has touched.
pub struct ProjectRegistry {
    config: Arc<AppConfig>,
    scheduler: Arc<dyn SchedulerClient>,
    projects: Mutex<HashMap<PathBuf, Arc<ProjectHandle>>>,
}

impl ProjectRegistry {
    pub fn new(config: Arc<AppConfig>, scheduler: Arc<dyn SchedulerClient>) -> ProjectRegistry {
        ProjectRegistry {
            config,
            scheduler,
            projects: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the handle for a project directory.
    pub async fn handle_for(&self, root: &Path) -> Arc<ProjectHandle> {
        let mut projects = self.projects.lock().await;
        if let Some(handle) = projects.get(root) {
            return Arc::clone(handle);
        }
        let handle = Arc::new(ProjectHandle::new(
            root.to_path_buf(),
            Arc::clone(&self.config),
            Arc::clone(&self.scheduler),
        ));
        projects.insert(root.to_path_buf(), Arc::clone(&handle));
        handle
    }

    /// The handle for an already-known project, if any.
    pub async fn existing(&self, root: &Path) -> Option<Arc<ProjectHandle>> {
        self.projects.lock().await.get(root).map(Arc::clone)
    }
}
