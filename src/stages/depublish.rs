//! Stage that removes records from the published index.

use async_trait::async_trait;
use std::sync::Arc;

use crate::envelope::RecordEnvelope;
use crate::retry::RetryExecutor;
use crate::services::Depublisher;
use crate::step::{Outcome, Stage, StepError};

/// Removes each record from publication and counts it as deleted.
pub struct DepublishStage {
    depublisher: Arc<dyn Depublisher>,
    retry: RetryExecutor,
}

impl DepublishStage {
    pub fn new(depublisher: Arc<dyn Depublisher>, retry: RetryExecutor) -> Self {
        Self { depublisher, retry }
    }
}

#[async_trait]
impl Stage for DepublishStage {
    fn name(&self) -> &'static str {
        "depublish"
    }

    async fn process(&self, envelope: RecordEnvelope) -> Result<Outcome, StepError> {
        let resource = envelope.resource.as_str();
        self.retry
            .execute(&format!("Error while depublishing {resource}"), || {
                self.depublisher.depublish(resource)
            })
            .await?;
        Ok(Outcome::drop(&envelope))
    }
}
