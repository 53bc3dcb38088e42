//! Agent worker.
//!
//! Holds at most one running batch. A `RunAgentTests` arriving while a batch is
//! active is rejected straight back to the server; nothing is queued.

use super::progress::AgentProgressNotifier;
use crate::bus::heartbeat::HeartbeatSender;
use crate::bus::{MessageBus, MessageBusExt};
use crate::model::messages::{
    AgentReady, AgentTestRunHeartbeat, AgentTestsComplete, CancelAgentTests, RequestAgents,
    RunAgentTests, ServerRegistered,
};
use crate::model::types::{TestExecutionInfo, TestSpec};
use crate::runner::{RunningTestData, TestRunner, TestRunnerResult};
use crate::workspace::handler::WorkspaceHandler;

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const NOT_RUN_MESSAGE: &str = "Test Not Run.  Check for stack overflow or other errors.  All batch output is attached to this test result.";

pub struct AgentWorker {
    agent_id: String,
    server_id: String,
    bus: Arc<dyn MessageBus>,
    workspace: Arc<WorkspaceHandler>,
    runner: Arc<dyn TestRunner>,
    progress: AgentProgressNotifier,
    heartbeat: HeartbeatSender,
    current: Mutex<Option<RunningTestData>>,
}

impl AgentWorker {
    pub fn new(
        agent_id: impl Into<String>,
        server_id: &str,
        bus: Arc<dyn MessageBus>,
        workspace: Arc<WorkspaceHandler>,
        runner: Arc<dyn TestRunner>,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_id: agent_id.into(),
            server_id: server_id.to_string(),
            progress: AgentProgressNotifier::new(bus.clone(), server_id),
            heartbeat: HeartbeatSender::new(bus.clone(), server_id)
                .with_interval(heartbeat_interval),
            bus,
            workspace,
            runner,
            current: Mutex::new(None),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn current_request_id(&self) -> Option<String> {
        self.current.lock().as_ref().map(|run| run.request_id.clone())
    }

    /// Subscribes to the agent messages and registers on the bus.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        self.bus.on_message(move |_sender, msg: RunAgentTests| {
            let this = this.clone();
            async move {
                this.handle_run_tests(msg).await;
                Ok(())
            }
        });

        let this = self.clone();
        self.bus.on_message(move |_sender, _msg: RequestAgents| {
            let this = this.clone();
            async move {
                this.announce_if_idle().await;
                Ok(())
            }
        });

        // A restarted server has lost every delegated run; idle workers speak up.
        let this = self.clone();
        self.bus.on_message(move |_sender, _msg: ServerRegistered| {
            let this = this.clone();
            async move {
                this.announce_if_idle().await;
                Ok(())
            }
        });

        let this = self.clone();
        self.bus.on_message(move |_sender, msg: CancelAgentTests| {
            let this = this.clone();
            async move {
                this.handle_cancel(&msg.request_id);
                Ok(())
            }
        });

        self.bus.register(&self.agent_id).await?;
        tracing::info!("Agent worker {} registered", self.agent_id);
        Ok(())
    }

    pub async fn handle_run_tests(&self, message: RunAgentTests) {
        let names: Vec<&str> = message
            .tests_to_run
            .iter()
            .map(|t| t.full_test_name.as_str())
            .collect();
        tracing::info!(
            "Agent {} running {} tests for {}",
            self.agent_id,
            names.len(),
            message.invocation_spec.id
        );
        tracing::debug!("Tests: {}", names.join(","));

        let run = match self.claim(&message) {
            Ok(run) => run,
            Err(active_request) => {
                tracing::error!(
                    "Run tests requested for {} but this agent is already processing tests",
                    self.agent_id
                );
                self.bus
                    .send(
                        &self.server_id,
                        &AgentTestsComplete {
                            invocation_id: message.invocation_spec.id.clone(),
                            request_id: message.request_id.clone(),
                            test_results: Vec::new(),
                            error: Some(format!(
                                "Agent {} can't accept this run request when another run ({}) is in progress.",
                                self.agent_id, active_request
                            )),
                        },
                    )
                    .await;
                return;
            }
        };

        let mut report = AgentTestsComplete {
            invocation_id: run.invocation.id.clone(),
            request_id: run.request_id.clone(),
            test_results: Vec::new(),
            error: None,
        };

        let heartbeat = self.heartbeat.start(AgentTestRunHeartbeat {
            request_id: run.request_id.clone(),
        });
        let outcome = self.execute(&run).await;
        heartbeat.stop().await;

        match outcome {
            Ok(result) => report.test_results = self.complete_results(&run.tests, result),
            Err(e) => {
                tracing::error!("Error running tests {}: {:#}", names.join(","), e);
                report.error = Some(format!("{:#}", e));
            }
        }

        self.bus.send(&self.server_id, &report).await;

        *self.current.lock() = None;
        self.announce_ready().await;
    }

    /// Takes the single batch slot, or returns the request id holding it.
    fn claim(&self, message: &RunAgentTests) -> Result<RunningTestData, String> {
        let mut current = self.current.lock();
        if let Some(active) = current.as_ref() {
            return Err(active.request_id.clone());
        }

        let run = RunningTestData {
            invocation: message.invocation_spec.clone(),
            request_id: message.request_id.clone(),
            tests: message.tests_to_run.clone(),
            cancel: CancellationToken::new(),
        };
        *current = Some(run.clone());
        Ok(run)
    }

    async fn execute(&self, run: &RunningTestData) -> Result<TestRunnerResult> {
        let workspace = self.workspace.create_local_workspace(&run.invocation).await?;
        self.runner
            .run_tests(run, &workspace, &self.progress)
            .await
    }

    /// Stamps the agent id on every result and fails the tests the runner
    /// never reported.
    fn complete_results(
        &self,
        requested: &[TestSpec],
        result: TestRunnerResult,
    ) -> Vec<TestExecutionInfo> {
        let mut results = result.test_results;
        let reported: HashSet<String> = results
            .iter()
            .map(|r| r.full_name().to_string())
            .collect();
        let batch_output = results
            .iter()
            .filter_map(|r| r.standard_output.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        for test in requested
            .iter()
            .filter(|t| !reported.contains(&t.full_test_name))
        {
            tracing::warn!("No result for {}, marking it not run", test.full_test_name);
            let mut missing = TestExecutionInfo::pending(test.clone());
            missing.fail_now(&self.agent_id, NOT_RUN_MESSAGE);
            missing.standard_output = (!batch_output.is_empty()).then(|| batch_output.clone());
            results.push(missing);
        }

        for result in &mut results {
            result.agent_id = Some(self.agent_id.clone());
        }
        results
    }

    fn handle_cancel(&self, request_id: &str) {
        let current = self.current.lock();
        match current.as_ref() {
            Some(run) if run.request_id == request_id => {
                tracing::debug!(
                    "Received cancel for running request {}, cancelling current run",
                    request_id
                );
                run.cancel.cancel();
            }
            _ => tracing::debug!("Cancel for request {} which is not running, ignoring", request_id),
        }
    }

    async fn announce_if_idle(&self) {
        let idle = self.current.lock().is_none();
        if idle {
            self.announce_ready().await;
        }
    }

    async fn announce_ready(&self) {
        self.bus
            .send(
                &self.server_id,
                &AgentReady {
                    agent_id: self.agent_id.clone(),
                },
            )
            .await;
    }

    /// Cancels the active batch and leaves the bus.
    pub async fn shutdown(&self) {
        if let Some(run) = self.current.lock().as_ref() {
            run.cancel.cancel();
        }
        self.bus.shutdown().await;
    }
}
