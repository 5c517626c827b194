use std::sync::Arc;
use std::time::Duration;

use super::job::UnfinishedTaskMonitor;
use crate::config::MonitorConfig;
use crate::services::RunRegistry;
use crate::tracker::TaskStatusTracker;

/// Shortest time allowed between sweeps.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Builder for configuring an UnfinishedTaskMonitor.
pub struct MonitorBuilder {
    tracker: TaskStatusTracker,
    registry: Arc<dyn RunRegistry>,
    interval: Duration,
    run_on_start: bool,
}

impl MonitorBuilder {
    /// Create a new monitor builder.
    pub fn new(tracker: TaskStatusTracker, registry: Arc<dyn RunRegistry>) -> Self {
        let defaults = MonitorConfig::default();
        Self {
            tracker,
            registry,
            interval: defaults.interval(),
            run_on_start: defaults.run_on_start,
        }
    }

    /// Apply interval and start behaviour from configuration.
    pub fn config(self, config: &MonitorConfig) -> Self {
        self.interval(config.interval())
            .run_on_start(config.run_on_start)
    }

    /// Set the time between sweeps. Anything shorter than a second is raised to one.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Set whether to sweep immediately on start.
    pub fn run_on_start(mut self, run: bool) -> Self {
        self.run_on_start = run;
        self
    }

    /// Build the monitor.
    pub fn build(self) -> UnfinishedTaskMonitor {
        UnfinishedTaskMonitor {
            tracker: self.tracker,
            registry: self.registry,
            interval: self.interval,
            run_on_start: self.run_on_start,
        }
    }
}
