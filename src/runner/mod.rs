//! Stage workers and the runner driving them.

#[allow(clippy::module_inception)]
mod runner;
pub mod worker;

pub use runner::{RunnerBuilder, TopologyRunner};
pub use worker::StageWorker;
