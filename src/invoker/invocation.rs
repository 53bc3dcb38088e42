use super::paths::validate_paths;
use super::serializer::ResultSerializer;
use crate::bus::heartbeat::{HEARTBEAT_INTERVAL, HeartbeatSender};
use crate::bus::types::ConnectionEvent;
use crate::bus::{MessageBus, MessageBusExt};
use crate::config::{InvokerConfig, ServerConnectionConfig, WorkspaceConfig};
use crate::model::messages::{
    AgentTestStatusUpdate, InvokeTests, InvokerHeartbeat, TestsComplete, TestsProgress,
};
use crate::model::types::{RemotePathInfo, TestInvocationExecutionInfo};
use crate::workspace::transfer::HttpFileTransfer;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

/// How an invocation ended from the invoker's point of view.
#[derive(Debug)]
pub enum InvocationOutcome {
    /// The results were written through the serializer.
    Completed(TestInvocationExecutionInfo),
    /// The server reported an error instead of results.
    Rejected(String),
    /// The server was unreachable for longer than the reconnect timeout.
    ConnectionLost,
}

impl InvocationOutcome {
    pub fn wrote_results(&self) -> bool {
        matches!(self, InvocationOutcome::Completed(_))
    }
}

/// Requests one invocation, serves the build output to the server, and waits
/// for the aggregate result.
pub struct Invoker {
    invoker_id: String,
    config: InvokerConfig,
    connection: ServerConnectionConfig,
    bus: Arc<dyn MessageBus>,
    transfer: Arc<HttpFileTransfer>,
    serializer: Arc<dyn ResultSerializer>,
    heartbeat_interval: Duration,
}

impl Invoker {
    pub fn new(
        config: InvokerConfig,
        connection: ServerConnectionConfig,
        workspace: &WorkspaceConfig,
        bus: Arc<dyn MessageBus>,
        serializer: Arc<dyn ResultSerializer>,
    ) -> Self {
        Self {
            invoker_id: format!("Invoker_{}", Uuid::new_v4()),
            transfer: HttpFileTransfer::new(bus.clone(), connection.clone(), workspace),
            config,
            connection,
            bus,
            serializer,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn invoker_id(&self) -> &str {
        &self.invoker_id
    }

    pub async fn run(&self) -> Result<InvocationOutcome> {
        let paths = validate_paths(
            &self.config.test_assembly_path,
            self.config.base_path.as_deref(),
        )?;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let subscriptions = vec![
            self.bus.on_message(move |_sender, msg: TestsComplete| {
                let done_tx = done_tx.clone();
                async move {
                    let _ = done_tx.send(msg);
                    Ok(())
                }
            }),
            self.bus.on_message(|sender_id, msg: AgentTestStatusUpdate| async move {
                match msg.message_text {
                    Some(text) if !text.is_empty() => tracing::info!(
                        "{} {:?}: {} (from {})",
                        msg.test.full_test_name,
                        msg.update_type,
                        text,
                        sender_id
                    ),
                    _ => tracing::info!(
                        "{} {:?} (from {})",
                        msg.test.full_test_name,
                        msg.update_type,
                        sender_id
                    ),
                }
                Ok(())
            }),
            self.bus.on_message(|_sender, msg: TestsProgress| async move {
                tracing::info!(
                    "Progress Update: Completed {} tests.  {}",
                    msg.completed_tests_count,
                    msg.message
                );
                Ok(())
            }),
        ];
        self.transfer.init();

        let mut events = self.bus.subscribe_events();
        self.bus.register(&self.invoker_id).await?;

        let invocation_id = format!("Invocation_{}", Uuid::new_v4());
        tracing::info!(
            "Beginning invocation {} of {} from {:?}",
            invocation_id,
            paths.test_assembly_path,
            paths.base_path
        );
        self.bus
            .send(
                &self.connection.server_id,
                &InvokeTests {
                    invocation_id: invocation_id.clone(),
                    source_path: RemotePathInfo {
                        host_id: self.invoker_id.clone(),
                        source_path: paths.base_path.to_string_lossy().into_owned(),
                    },
                    test_assembly_path: paths.test_assembly_path.clone(),
                    max_retry_count: self.config.max_retry_count,
                    test_inactivity_timeout_seconds: self.config.test_inactivity_timeout_seconds,
                },
            )
            .await;

        let heartbeat = HeartbeatSender::new(self.bus.clone(), self.connection.server_id.clone())
            .with_interval(self.heartbeat_interval)
            .start(InvokerHeartbeat {
                invocation_id: invocation_id.clone(),
            });
        let completion = self.wait_for_completion(&mut done_rx, &mut events).await;
        heartbeat.stop().await;

        for subscription in &subscriptions {
            subscription.revoke();
        }

        let outcome = match completion {
            None => InvocationOutcome::ConnectionLost,
            Some(TestsComplete {
                error: Some(error), ..
            }) => {
                tracing::error!("{}", error);
                InvocationOutcome::Rejected(error)
            }
            Some(TestsComplete {
                results: Some(results),
                ..
            }) => {
                self.serializer
                    .serialize(&self.config.result_filename, &results)
                    .await?;
                InvocationOutcome::Completed(results)
            }
            Some(_) => InvocationOutcome::Rejected("Server sent neither results nor an error".to_string()),
        };

        tracing::debug!("Invocation {} complete", invocation_id);
        Ok(outcome)
    }

    /// Waits for `TestsComplete`. A disconnect arms the reconnect timer; a
    /// reconnect disarms it. Returns `None` when the timer fires.
    async fn wait_for_completion(
        &self,
        done: &mut mpsc::UnboundedReceiver<TestsComplete>,
        events: &mut broadcast::Receiver<ConnectionEvent>,
    ) -> Option<TestsComplete> {
        let mut deadline: Option<Instant> = None;

        loop {
            let armed = deadline;
            let timer = async move {
                match armed {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                message = done.recv() => return message,
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Disconnected) => {
                        tracing::warn!("Lost connection to server.");
                        deadline.get_or_insert(Instant::now() + self.config.reconnect_timeout);
                    }
                    Ok(ConnectionEvent::Reconnected) => {
                        tracing::info!("Reconnected to server");
                        deadline = None;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return done.recv().await,
                },
                _ = timer => {
                    tracing::error!("Connection retry to server timed out.");
                    return None;
                }
            }
        }
    }
}
