//! Reconciliation of tasks left running by dead pipeline runs.

mod builder;
mod job;

pub use builder::MonitorBuilder;
pub use job::UnfinishedTaskMonitor;
