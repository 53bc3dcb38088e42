//! Periodic health sweep over agents and invokers.
//!
//! ## Checks (per sweep)
//! 1. Agent sub-run heartbeat older than [`HEARTBEAT_TIMEOUT`]: fail the sub-run.
//! 2. Agent sub-run with no test activity within the invocation's inactivity timeout: fail it.
//! 3. A second live sub-run for the same agent: fail the newer one.
//! 4. Invoker heartbeat older than [`HEARTBEAT_TIMEOUT`]: fail the whole invocation.
//!
//! Invocations that still have queued tests get a fresh `RequestAgents` broadcast
//! every sweep, since idle agents only answer when asked.

use super::complete::TestCompleteHandler;
use super::state::ServerTestState;
use super::types::{AgentDelegatedTestRun, ServerTestRun};
use crate::bus::{MessageBus, MessageBusExt};
use crate::model::messages::{
    AgentTestRunHeartbeat, AgentTestStatusUpdate, CancelAgentTests, HostDisconnected,
    InvokerHeartbeat, RequestAgents,
};

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(180);

pub struct TestHealthMonitor {
    bus: Arc<dyn MessageBus>,
    state: Arc<ServerTestState>,
    complete: Arc<TestCompleteHandler>,
    interval: Duration,
    shutdown: CancellationToken,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl TestHealthMonitor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        state: Arc<ServerTestState>,
        complete: Arc<TestCompleteHandler>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            state,
            complete,
            interval,
            shutdown: CancellationToken::new(),
            sweep: Mutex::new(None),
        })
    }

    /// Subscribes to liveness messages and starts the sweep timer.
    pub fn init(self: &Arc<Self>) {
        let this = self.clone();
        self.bus.on_message(move |_sender, msg: InvokerHeartbeat| {
            let this = this.clone();
            async move {
                match this.state.get_server_run(&msg.invocation_id) {
                    Some(run) => run.touch_invoker_heartbeat(),
                    None => tracing::debug!(
                        "Invoker heartbeat for {} which no longer exists, ignoring",
                        msg.invocation_id
                    ),
                }
                Ok(())
            }
        });

        let this = self.clone();
        self.bus.on_message(move |sender_id, msg: AgentTestRunHeartbeat| {
            let this = this.clone();
            async move {
                match this.state.get_agent_delegated_run(&msg.request_id) {
                    Some(run) => run.touch_heartbeat(),
                    None => tracing::debug!(
                        "Heartbeat from {} for a run that no longer exists, ignoring",
                        sender_id
                    ),
                }
                Ok(())
            }
        });

        let this = self.clone();
        self.bus.on_message(move |sender_id, msg: AgentTestStatusUpdate| {
            let this = this.clone();
            async move {
                match this.state.get_agent_delegated_run(&msg.agent_run_request_id) {
                    Some(run) => run.touch_activity(),
                    None => tracing::debug!(
                        "Status update from {} for a run that no longer exists, ignoring",
                        sender_id
                    ),
                }
                Ok(())
            }
        });

        let this = self.clone();
        self.bus.on_message(move |_sender, msg: HostDisconnected| {
            let this = this.clone();
            async move {
                this.handle_host_disconnected(&msg.host_id).await;
                Ok(())
            }
        });

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(this.interval) => this.check_health().await,
                }
            }
        });
        *self.sweep.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.sweep.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Fails the departing host's sub-runs and any invocation it owns.
    pub async fn handle_host_disconnected(&self, host_id: &str) {
        let agent_runs = self.state.get_active_runs_for_agent(host_id);
        let owned: Vec<_> = self
            .state
            .get_active_server_runs()
            .into_iter()
            .filter(|run| run.spec.invoker_id == host_id)
            .collect();

        if agent_runs.is_empty() && owned.is_empty() {
            tracing::debug!("Host {} disconnected with no active work", host_id);
            return;
        }

        tracing::warn!(
            "Host {} disconnected: failing {} agent run(s) and {} invocation(s)",
            host_id,
            agent_runs.len(),
            owned.len()
        );
        for run in owned {
            self.fail_server_run(&run).await;
        }
        for run in agent_runs {
            self.fail_run(&run).await;
        }
    }

    pub async fn check_health(&self) {
        let mut agent_runs = self.state.get_active_agent_delegated_runs();
        agent_runs.sort_by_key(|r| r.dispatched_at);
        tracing::debug!("Checking {} agent run(s)", agent_runs.len());

        let mut seen_agents = HashSet::new();
        let mut runs_to_fail = Vec::new();

        for run in agent_runs {
            let heartbeat_age = run.heartbeat_age();
            let activity_age = run.activity_age();
            let inactivity_timeout =
                Duration::from_secs(run.partial_tests.invocation_spec.test_inactivity_timeout_seconds);

            if heartbeat_age > HEARTBEAT_TIMEOUT {
                tracing::error!(
                    "Heartbeat for agent '{}' exceeded {:?} (was {:?}), stopping tests",
                    run.agent_id,
                    HEARTBEAT_TIMEOUT,
                    heartbeat_age
                );
                runs_to_fail.push(run);
            } else if activity_age > inactivity_timeout {
                tracing::error!(
                    "No test activity on agent '{}' for {:?} (limit {:?}), stopping tests",
                    run.agent_id,
                    activity_age,
                    inactivity_timeout
                );
                runs_to_fail.push(run);
            } else if !seen_agents.insert(run.agent_id.clone()) {
                tracing::warn!(
                    "Found another run for agent '{}', shutting request {} down",
                    run.agent_id,
                    run.request_id
                );
                runs_to_fail.push(run);
            }
        }

        for run in runs_to_fail {
            self.fail_run(&run).await;
        }

        for server_run in self.state.get_active_server_runs() {
            let age = server_run.invoker_heartbeat_age();
            if age > HEARTBEAT_TIMEOUT {
                tracing::error!(
                    "Heartbeat for invoker '{}' exceeded {:?} (was {:?}), stopping invocation {}",
                    server_run.spec.invoker_id,
                    HEARTBEAT_TIMEOUT,
                    age,
                    server_run.spec.id
                );
                self.fail_server_run(&server_run).await;
            } else if server_run.pending_count() > 0 {
                self.bus
                    .broadcast(&RequestAgents {
                        invocation_spec: server_run.spec.clone(),
                    })
                    .await;
            } else {
                tracing::debug!(
                    "Invocation {}: 0 tests waiting, {} of {} completed",
                    server_run.spec.id,
                    server_run.processed_by_full_name.len(),
                    server_run.tests_by_full_name.len()
                );
            }
        }
    }

    /// Removes a sub-run, tells its agent to stop and pushes its unfinished
    /// tests through the retry-or-finalize path.
    pub async fn fail_run(&self, run: &AgentDelegatedTestRun) {
        let invocation_id = run.invocation_id();
        let removed = self
            .state
            .remove_agent_delegated_run(invocation_id, &run.request_id);

        self.bus
            .send(
                &run.agent_id,
                &CancelAgentTests {
                    request_id: run.request_id.clone(),
                },
            )
            .await;

        let Some(removed) = removed else {
            return;
        };

        let spec = &removed.partial_tests.invocation_spec;
        for test in &removed.partial_tests.tests_to_run {
            let Some(mut record) = self.state.get_test_result(invocation_id, &test.full_test_name)
            else {
                continue;
            };
            if record.outcome.is_some() {
                continue;
            }

            tracing::debug!(
                "Test {} in failed run {} (agent {}) is being retried",
                test.full_test_name,
                run.request_id,
                run.agent_id
            );
            record.fail_now(
                &run.agent_id,
                format!("Agent {} was faulted, this test has failed.", run.agent_id),
            );
            record.attempt_count += 1;
            self.complete.complete_or_requeue(spec, record).await;
        }
    }

    /// Drops the invocation, then cancels its sub-runs. Nothing is requeued.
    pub async fn fail_server_run(&self, server_run: &ServerTestRun) {
        let agent_runs: Vec<_> = server_run
            .agent_runs_by_request_id
            .iter()
            .map(|r| r.value().clone())
            .collect();

        self.state.remove_test_run(&server_run.spec.id);

        join_all(agent_runs.iter().map(|run| self.fail_run(run))).await;
    }
}
