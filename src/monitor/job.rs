use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::services::RunRegistry;
use crate::task::TaskState;
use crate::tracker::TaskStatusTracker;

/// Periodically fails tasks whose owning run is gone.
///
/// Only tasks in `CURRENTLY_PROCESSING` with a recorded owner are checked.
/// A failed task can be submitted again with `restart`.
pub struct UnfinishedTaskMonitor {
    pub(crate) tracker: TaskStatusTracker,
    pub(crate) registry: Arc<dyn RunRegistry>,
    pub(crate) interval: Duration,
    pub(crate) run_on_start: bool,
}

impl UnfinishedTaskMonitor {
    /// Check every running task once. Returns the number of tasks failed.
    pub async fn sweep_once(&self) -> Result<usize, StoreError> {
        let running = self
            .tracker
            .list_by_state(&[TaskState::CurrentlyProcessing])
            .await?;
        debug!(count = running.len(), "Checking running tasks");

        let mut liveness: HashMap<String, bool> = HashMap::new();
        let mut failed = 0;
        for task in running {
            let Some(owner) = task.owner else {
                continue;
            };
            let active = match liveness.get(&owner) {
                Some(active) => *active,
                None => match self.registry.is_active(&owner).await {
                    Ok(active) => {
                        liveness.insert(owner.clone(), active);
                        active
                    }
                    Err(e) => {
                        warn!(owner = %owner, error = %e.inner(), "Cannot check run, skipping its tasks");
                        continue;
                    }
                },
            };
            if active {
                continue;
            }

            let reason = format!("The run {owner} processing this task is no longer active");
            if self.tracker.fail_task(task.id, &reason).await? {
                warn!(task_id = %task.id, owner = %owner, "Failed abandoned task");
                failed += 1;
            }
        }

        if failed > 0 {
            info!(failed, "Abandoned tasks failed");
        }
        Ok(failed)
    }

    /// Sweep at the configured interval indefinitely.
    pub async fn run(&self) -> ! {
        info!(
            interval_secs = self.interval.as_secs(),
            run_on_start = self.run_on_start,
            "Starting unfinished task monitor"
        );

        if self.run_on_start {
            self.sweep_logged().await;
        }

        let mut ticker = interval(self.interval);
        ticker.tick().await; // Consume immediate first tick

        loop {
            ticker.tick().await;
            self.sweep_logged().await;
        }
    }

    async fn sweep_logged(&self) {
        if let Err(e) = self.sweep_once().await {
            error!(error = %e, "Unfinished task sweep failed");
        }
    }
}
