use crate::bus::{MessageBus, MessageBusExt};
use crate::model::messages::{AgentTestStatusUpdate, StatusUpdateType};
use crate::model::types::TestSpec;
use crate::runner::{ProgressSink, RunningTestData};

use async_trait::async_trait;
use std::sync::Arc;

/// Sends each test's status to the invoker, and to the server so it can track
/// test activity on the batch.
pub struct AgentProgressNotifier {
    bus: Arc<dyn MessageBus>,
    server_id: String,
}

impl AgentProgressNotifier {
    pub fn new(bus: Arc<dyn MessageBus>, server_id: impl Into<String>) -> Self {
        Self {
            bus,
            server_id: server_id.into(),
        }
    }
}

#[async_trait]
impl ProgressSink for AgentProgressNotifier {
    async fn notify(
        &self,
        run: &RunningTestData,
        test: &TestSpec,
        update_type: StatusUpdateType,
        message: Option<String>,
    ) {
        let update = AgentTestStatusUpdate {
            invocation_id: run.invocation.id.clone(),
            agent_run_request_id: run.request_id.clone(),
            test: test.clone(),
            update_type,
            message_text: message,
        };

        self.bus.send(&run.invocation.invoker_id, &update).await;
        self.bus.send(&self.server_id, &update).await;
    }
}
