use super::complete::TestCompleteHandler;
use super::retriever::TestRetriever;
use super::state::ServerTestState;
use super::types::StateError;
use crate::bus::{MessageBus, MessageBusExt};
use crate::model::messages::{AgentReady, InvokeTests, RequestAgents, RunAgentTests, TestsComplete};
use crate::model::types::InvocationSpec;

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

/// Turns invoke requests into scheduled runs and hands batches to ready agents.
pub struct TestStarter {
    bus: Arc<dyn MessageBus>,
    retriever: Arc<TestRetriever>,
    state: Arc<ServerTestState>,
    complete: Arc<TestCompleteHandler>,
}

impl TestStarter {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        retriever: Arc<TestRetriever>,
        state: Arc<ServerTestState>,
        complete: Arc<TestCompleteHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            retriever,
            state,
            complete,
        })
    }

    pub fn init(self: &Arc<Self>) {
        let this = self.clone();
        self.bus.on_message(move |sender_id, msg: InvokeTests| {
            let this = this.clone();
            async move {
                this.handle_invoke_tests(&sender_id, msg).await;
                Ok(())
            }
        });

        let this = self.clone();
        self.bus.on_message(move |sender_id, _msg: AgentReady| {
            let this = this.clone();
            async move { this.handle_agent_ready(&sender_id).await }
        });
    }

    pub async fn handle_invoke_tests(&self, sender_id: &str, message: InvokeTests) {
        let spec = InvocationSpec {
            id: message.invocation_id,
            invoker_id: sender_id.to_string(),
            source_path: message.source_path,
            test_assembly_path: message.test_assembly_path,
            max_retry_count: message.max_retry_count,
            test_inactivity_timeout_seconds: message.test_inactivity_timeout_seconds,
            requested_at: Utc::now(),
        };

        tracing::info!(
            "Running tests in {} from {}: id {}",
            spec.test_assembly_path,
            spec.invoker_id,
            spec.id
        );

        if let Err(e) = self.start(&spec).await {
            tracing::error!("Test run {} could not start: {:#}", spec.id, e);

            let duplicate = matches!(
                e.downcast_ref::<StateError>(),
                Some(StateError::DuplicateInvocation(_))
            );
            if !duplicate {
                self.state.remove_test_run(&spec.id);
            }

            self.bus
                .send(
                    sender_id,
                    &TestsComplete {
                        results: None,
                        error: Some(format!("An error occurred starting the tests: {:#}", e)),
                    },
                )
                .await;
            return;
        }

        if self.state.has_completed(&spec.id) {
            // Nothing left to schedule.
            self.complete.finish(&spec.id).await;
        } else {
            self.bus.broadcast(&RequestAgents { invocation_spec: spec }).await;
        }
    }

    async fn start(&self, spec: &InvocationSpec) -> Result<()> {
        let tests = self.retriever.retrieve_tests_to_execute(spec).await?;
        self.state.add_test_run(spec.clone(), tests)?;
        Ok(())
    }

    pub async fn handle_agent_ready(&self, agent_id: &str) -> Result<()> {
        let Some(next) = self.state.get_next_tests() else {
            tracing::debug!("Agent {} ready, but no tests to queue", agent_id);
            return Ok(());
        };

        tracing::debug!(
            "Sending agent {} {} tests: {}",
            agent_id,
            next.tests_to_run.len(),
            next.tests_to_run
                .iter()
                .map(|t| t.full_test_name.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );

        let agent_run = self.state.add_agent_delegated_run(agent_id, next)?;
        self.bus
            .send(
                agent_id,
                &RunAgentTests {
                    request_id: agent_run.request_id.clone(),
                    invocation_spec: agent_run.partial_tests.invocation_spec.clone(),
                    tests_to_run: agent_run.partial_tests.tests_to_run.clone(),
                },
            )
            .await;
        Ok(())
    }
}
