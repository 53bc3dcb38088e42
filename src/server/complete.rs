use super::state::ServerTestState;
use crate::bus::{MessageBus, MessageBusExt};
use crate::model::messages::{AgentTestsComplete, TestsComplete, TestsProgress};
use crate::model::types::{
    InvocationSpec, TestExecutionInfo, TestInvocationExecutionInfo, TestOutcome,
};

use anyhow::Result;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

const NO_OUTCOME_MESSAGE: &str = "Agent reported no outcome for this test.";
const NO_RESULT_MESSAGE: &str = "Agent reported no result for this test.";

/// Applies agent reports and synthetic failures to the scheduling state,
/// deciding per test between a retry and a final outcome.
pub struct TestCompleteHandler {
    bus: Arc<dyn MessageBus>,
    state: Arc<ServerTestState>,
}

impl TestCompleteHandler {
    pub fn new(bus: Arc<dyn MessageBus>, state: Arc<ServerTestState>) -> Arc<Self> {
        Arc::new(Self { bus, state })
    }

    pub fn init(self: &Arc<Self>) {
        let this = self.clone();
        self.bus
            .on_message(move |sender_id, msg: AgentTestsComplete| {
                let this = this.clone();
                async move { this.handle_agent_tests_complete(&sender_id, msg).await }
            });
    }

    pub async fn handle_agent_tests_complete(
        &self,
        sender_id: &str,
        message: AgentTestsComplete,
    ) -> Result<()> {
        let Some(agent_run) = self
            .state
            .remove_agent_delegated_run(&message.invocation_id, &message.request_id)
        else {
            tracing::debug!(
                "Completion from {} for request {} that no longer exists, ignoring",
                sender_id,
                message.request_id
            );
            return Ok(());
        };
        let Some(spec) = self.state.invocation_spec(&message.invocation_id) else {
            return Ok(());
        };

        if let Some(error) = &message.error {
            tracing::warn!(
                "Agent {} failed request {}: {}",
                agent_run.agent_id,
                agent_run.request_id,
                error
            );
            for test in &agent_run.partial_tests.tests_to_run {
                let Some(mut record) = self
                    .state
                    .get_test_result(&spec.id, &test.full_test_name)
                else {
                    continue;
                };
                if record.outcome.is_some() {
                    continue;
                }
                record.fail_now(&agent_run.agent_id, error.clone());
                record.attempt_count += 1;
                self.complete_or_requeue(&spec, record).await;
            }
            return Ok(());
        }

        let batch = &agent_run.partial_tests.tests_to_run;
        let mut reported_by_name: HashMap<String, TestExecutionInfo> = HashMap::new();
        for reported in message.test_results {
            let name = reported.full_name().to_string();
            if !batch.iter().any(|t| t.full_test_name == name) {
                tracing::warn!(
                    "Agent {} reported test {} outside request {}, ignoring",
                    sender_id,
                    name,
                    agent_run.request_id
                );
                continue;
            }
            match reported_by_name.entry(name) {
                Entry::Vacant(slot) => {
                    slot.insert(reported);
                }
                Entry::Occupied(slot) => tracing::warn!(
                    "Agent {} reported test {} twice, keeping the first result",
                    sender_id,
                    slot.key()
                ),
            }
        }

        for test in batch {
            let Some(mut record) = self
                .state
                .get_test_result(&spec.id, &test.full_test_name)
            else {
                continue;
            };

            match reported_by_name.remove(&test.full_test_name) {
                Some(reported) => {
                    record.outcome = Some(reported.outcome.unwrap_or(TestOutcome::Failed));
                    record.error_message = match reported.outcome {
                        Some(_) => reported.error_message,
                        None => Some(NO_OUTCOME_MESSAGE.to_string()),
                    };
                    record.standard_output = reported.standard_output;
                    record.error_output = reported.error_output;
                    record.stack_trace = reported.stack_trace;
                    record.start_date_time = reported.start_date_time;
                    record.end_date_time = reported.end_date_time;
                    record.agent_id = reported
                        .agent_id
                        .or_else(|| Some(agent_run.agent_id.clone()));
                }
                None if record.outcome.is_some() => continue,
                None => record.fail_now(&agent_run.agent_id, NO_RESULT_MESSAGE),
            }
            record.attempt_count += 1;

            self.complete_or_requeue(&spec, record).await;
        }

        Ok(())
    }

    /// Requeues a failed test that still has retries left, otherwise stores its
    /// final outcome. Finalizes the invocation once every test is processed.
    pub async fn complete_or_requeue(&self, spec: &InvocationSpec, mut test: TestExecutionInfo) {
        let completed = self.state.get_completed_test_count(&spec.id);
        let agent = test.agent_id.clone().unwrap_or_default();

        let message = if test.outcome == Some(TestOutcome::Failed)
            && test.attempt_count <= spec.max_retry_count
        {
            test.outcome = None;
            format!(
                "Test '{}' failed on agent '{}', and is being retried (current attempt count {})",
                test.full_name(),
                agent,
                test.attempt_count
            )
        } else {
            format!(
                "Test '{}' finished on agent '{}' with outcome '{}'.",
                test.full_name(),
                agent,
                test.outcome
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "Unknown".to_string())
            )
        };
        tracing::debug!("{}", message);

        self.bus
            .send(
                &spec.invoker_id,
                &TestsProgress {
                    message,
                    completed_tests_count: completed,
                },
            )
            .await;

        if let Err(e) = self.state.set_test_result(&spec.id, test) {
            tracing::debug!("Dropping result: {}", e);
            return;
        }

        if self.state.has_completed(&spec.id) {
            self.finish(&spec.id).await;
        }
    }

    /// Persists the finish in the stats, sends the aggregate result to the
    /// invoker and drops the run.
    pub(crate) async fn finish(&self, invocation_id: &str) {
        let Some(run) = self.state.get_server_run(invocation_id) else {
            return;
        };
        self.state.record_finish(invocation_id).await;

        let mut tests: Vec<TestExecutionInfo> = run
            .tests_by_full_name
            .iter()
            .map(|t| t.value().clone())
            .collect();
        tests.sort_by(|a, b| a.full_name().cmp(b.full_name()));

        tracing::info!(
            "Sending {} results for invocation {} to {}",
            tests.len(),
            invocation_id,
            run.spec.invoker_id
        );

        self.bus
            .send(
                &run.spec.invoker_id,
                &TestsComplete {
                    results: Some(TestInvocationExecutionInfo {
                        spec: run.spec.clone(),
                        tests,
                    }),
                    error: None,
                },
            )
            .await;

        self.state.remove_test_run(invocation_id);
    }
}
