//! A scheduler client that records cancellations instead of shelling out.

use async_trait::async_trait;
use cb_core::error::CoreResult;
use cb_core::scheduler::{SchedulerClient, SchedulerJob};
use std::sync::Mutex;

#[derive(Default)]
pub struct MockScheduler {
    pub jobs: Mutex<Vec<SchedulerJob>>,
    pub cancelled: Mutex<Vec<String>>,
}

impl MockScheduler {
    pub fn with_running_job(project_root: &str) -> MockScheduler {
        MockScheduler {
            jobs: Mutex::new(vec![SchedulerJob {
                job_id: "4242".to_string(),
                name: "qsub.sh".to_string(),
                state: "RUNNING".to_string(),
                workdir: format!("{project_root}/External/job002"),
            }]),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn list_jobs(&self) -> CoreResult<Vec<SchedulerJob>> {
        Ok(self.jobs.lock().unwrap().clone())
    }

    async fn cancel(&self, job_id: &str) -> CoreResult<()> {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}
