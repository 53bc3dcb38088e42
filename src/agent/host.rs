use super::worker::AgentWorker;
use crate::bus::MessageBus;
use crate::bus::client::HttpBusClient;
use crate::bus::heartbeat::HEARTBEAT_INTERVAL;
use crate::config::{AgentConfig, ServerConnectionConfig, WorkspaceConfig};
use crate::runner::TestRunner;
use crate::workspace::handler::WorkspaceHandler;
use crate::workspace::transfer::HttpFileTransfer;

use anyhow::Result;
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use uuid::Uuid;

/// All workers of one agent process. Each worker has its own bus client and
/// registers as `Agent_<name>_<ix>`.
pub struct AgentHost {
    workers: Vec<Arc<AgentWorker>>,
}

impl AgentHost {
    pub async fn start(
        config: AgentConfig,
        connection: ServerConnectionConfig,
        workspace: WorkspaceConfig,
        runner: Arc<dyn TestRunner>,
    ) -> Result<Arc<Self>> {
        let base_id = format!(
            "Agent_{}",
            config
                .name
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string())
        );
        let count = config.effective_workers();
        tracing::info!("Starting {} agent worker(s) as {}", count, base_id);

        let workers: Vec<Arc<AgentWorker>> = (0..count)
            .map(|ix| {
                let client = HttpBusClient::new(connection.clone());
                let bus: Arc<dyn MessageBus> = client;

                let transfer = HttpFileTransfer::new(bus.clone(), connection.clone(), &workspace);
                transfer.init();

                AgentWorker::new(
                    format!("{}_{}", base_id, ix),
                    &connection.server_id,
                    bus,
                    WorkspaceHandler::new(workspace.clone(), transfer),
                    runner.clone(),
                    HEARTBEAT_INTERVAL,
                )
            })
            .collect();

        try_join_all(workers.iter().map(|w| w.init())).await?;

        Ok(Arc::new(Self { workers }))
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.workers
            .iter()
            .map(|w| w.agent_id().to_string())
            .collect()
    }

    /// Each worker broadcasts its departure and closes its client.
    pub async fn stop(&self) {
        join_all(self.workers.iter().map(|w| w.shutdown())).await;
        tracing::info!("Agent workers stopped");
    }
}
