//! In-memory scheduling state for every running invocation.
//!
//! All mutation goes through [`ServerTestState`]; the maps inside a run are
//! individually lockable, and completion is finalized through a `OnceLock` so
//! only one caller ever observes it.

use super::types::*;
use crate::model::types::{InvocationSpec, TestExecutionInfo, TestOutcome, TestPartSpec};
use crate::stats::StatsService;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Rough guess of how many agents share the pool; batches shrink so the tail
/// of a run is spread over about this many agents.
pub const ASSUMED_AGENT_COUNT: usize = 32;

pub struct ServerTestState {
    batch_size: usize,
    stats: Arc<StatsService>,
    runs_by_invocation_id: DashMap<String, Arc<ServerTestRun>>,
}

impl ServerTestState {
    pub fn new(batch_size: usize, stats: Arc<StatsService>) -> Arc<Self> {
        Arc::new(Self {
            batch_size: batch_size.max(1),
            stats,
            runs_by_invocation_id: DashMap::new(),
        })
    }

    /// Registers an invocation and its enumerated tests.
    ///
    /// Every test whose full name occurs more than once is failed; one
    /// representative per name is kept as already processed.
    pub fn add_test_run(
        &self,
        spec: InvocationSpec,
        tests: Vec<TestExecutionInfo>,
    ) -> Result<Arc<ServerTestRun>, StateError> {
        if self.runs_by_invocation_id.contains_key(&spec.id) {
            return Err(StateError::DuplicateInvocation(spec.id));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for test in &tests {
            *counts.entry(test.full_name().to_string()).or_default() += 1;
        }

        let tests_by_full_name = DashMap::new();
        let processed_by_full_name = DashMap::new();
        let mut to_process = Vec::new();

        for mut test in tests {
            let name = test.full_name().to_string();
            if counts[&name] > 1 {
                if processed_by_full_name.contains_key(&name) {
                    continue;
                }
                test.outcome = Some(TestOutcome::Failed);
                test.error_message = Some(format!(
                    "Test full name of {} was detected more than once during test enumeration.  All tests with this name have been failed.",
                    name
                ));
                tracing::warn!("Duplicate test name {} in invocation {}", name, spec.id);
                tests_by_full_name.insert(name.clone(), test.clone());
                processed_by_full_name.insert(name, test);
            } else {
                tests_by_full_name.insert(name, test.clone());
                to_process.push(test);
            }
        }

        let run = Arc::new(ServerTestRun::new(
            spec,
            tests_by_full_name,
            processed_by_full_name,
            to_process,
        ));

        match self.runs_by_invocation_id.entry(run.spec.id.clone()) {
            Entry::Occupied(_) => Err(StateError::DuplicateInvocation(run.spec.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                tracing::info!(
                    "Added invocation {} with {} tests ({} pending)",
                    run.spec.id,
                    run.tests_by_full_name.len(),
                    run.pending_count()
                );
                Ok(run)
            }
        }
    }

    pub fn invocation_spec(&self, invocation_id: &str) -> Option<InvocationSpec> {
        self.runs_by_invocation_id
            .get(invocation_id)
            .map(|run| run.spec.clone())
    }

    pub fn get_test_result(
        &self,
        invocation_id: &str,
        full_test_name: &str,
    ) -> Option<TestExecutionInfo> {
        let run = self.get_server_run(invocation_id)?;
        let test = run.tests_by_full_name.get(full_test_name)?;
        Some(test.clone())
    }

    pub fn get_completed_test_count(&self, invocation_id: &str) -> usize {
        self.get_server_run(invocation_id)
            .map(|run| run.processed_by_full_name.len())
            .unwrap_or(0)
    }

    /// True exactly once per invocation: when every test is processed and no
    /// earlier call already finalized the run.
    pub fn has_completed(&self, invocation_id: &str) -> bool {
        let Some(run) = self.get_server_run(invocation_id) else {
            return false;
        };

        if !run.is_complete() || run.finished_at.set(Utc::now()).is_err() {
            return false;
        }

        tracing::info!("Invocation {} completed", invocation_id);
        true
    }

    /// Stamps the finished invocation in the stats and writes the stats file.
    pub async fn record_finish(&self, invocation_id: &str) {
        self.stats.record_invocation_finish(invocation_id).await;
    }

    /// Pops the next batch from the oldest invocation with pending tests.
    pub fn get_next_tests(&self) -> Option<TestPartSpec> {
        let mut candidates: Vec<Arc<ServerTestRun>> = self
            .runs_by_invocation_id
            .iter()
            .filter(|run| run.pending_count() > 0)
            .map(|run| run.value().clone())
            .collect();
        candidates.sort_by(|a, b| {
            a.spec
                .requested_at
                .cmp(&b.spec.requested_at)
                .then_with(|| a.spec.id.cmp(&b.spec.id))
        });

        for run in candidates {
            let popped = {
                let mut pool = run.tests_to_process.lock();
                let batch = effective_batch_size(self.batch_size, pool.len());
                let split_at = pool.len().saturating_sub(batch);
                pool.split_off(split_at)
            };

            if popped.is_empty() {
                continue;
            }

            if run.started_at.set(Utc::now()).is_ok() {
                self.stats.record_invocation_start(
                    &run.spec.id,
                    &run.spec.invoker_id,
                    &run.spec.test_assembly_path,
                );
            }

            return Some(TestPartSpec {
                invocation_spec: run.spec.clone(),
                // Most recently pushed first.
                tests_to_run: popped.into_iter().rev().map(|t| t.spec).collect(),
            });
        }

        None
    }

    pub fn add_agent_delegated_run(
        &self,
        agent_id: &str,
        part: TestPartSpec,
    ) -> Result<Arc<AgentDelegatedTestRun>, StateError> {
        let invocation_id = part.invocation_spec.id.clone();
        let run = self
            .get_server_run(&invocation_id)
            .ok_or(StateError::UnknownInvocation(invocation_id))?;

        let agent_run = Arc::new(AgentDelegatedTestRun::new(
            agent_id,
            Uuid::new_v4().to_string(),
            part,
        ));
        run.agent_runs_by_request_id
            .insert(agent_run.request_id.clone(), agent_run.clone());
        Ok(agent_run)
    }

    /// Upserts a test record. A terminal outcome marks the test processed and
    /// feeds the stats; a pending one puts the test back in the pool.
    pub fn set_test_result(
        &self,
        invocation_id: &str,
        result: TestExecutionInfo,
    ) -> Result<(), StateError> {
        let run = self
            .get_server_run(invocation_id)
            .ok_or_else(|| StateError::UnknownInvocation(invocation_id.to_string()))?;
        let name = result.full_name().to_string();

        run.tests_by_full_name.insert(name.clone(), result.clone());

        match result.outcome {
            Some(outcome) => {
                self.stats.record_test_result(
                    invocation_id,
                    result.agent_id.as_deref().unwrap_or_default(),
                    &name,
                    outcome,
                    result.duration(),
                );
                run.processed_by_full_name.insert(name, result);
            }
            None => run.tests_to_process.lock().push(result),
        }
        Ok(())
    }

    pub fn get_active_agent_delegated_runs(&self) -> Vec<Arc<AgentDelegatedTestRun>> {
        self.runs_by_invocation_id
            .iter()
            .flat_map(|run| {
                run.agent_runs_by_request_id
                    .iter()
                    .map(|r| r.value().clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn get_agent_delegated_run(&self, request_id: &str) -> Option<Arc<AgentDelegatedTestRun>> {
        self.runs_by_invocation_id.iter().find_map(|run| {
            run.agent_runs_by_request_id
                .get(request_id)
                .map(|r| r.value().clone())
        })
    }

    pub fn get_active_runs_for_agent(&self, agent_id: &str) -> Vec<Arc<AgentDelegatedTestRun>> {
        self.get_active_agent_delegated_runs()
            .into_iter()
            .filter(|r| r.agent_id == agent_id)
            .collect()
    }

    pub fn get_active_server_runs(&self) -> Vec<Arc<ServerTestRun>> {
        self.runs_by_invocation_id
            .iter()
            .map(|run| run.value().clone())
            .collect()
    }

    pub fn get_server_run(&self, invocation_id: &str) -> Option<Arc<ServerTestRun>> {
        self.runs_by_invocation_id
            .get(invocation_id)
            .map(|run| run.value().clone())
    }

    pub fn remove_agent_delegated_run(
        &self,
        invocation_id: &str,
        request_id: &str,
    ) -> Option<Arc<AgentDelegatedTestRun>> {
        let run = self.get_server_run(invocation_id)?;
        run.agent_runs_by_request_id
            .remove(request_id)
            .map(|(_, agent_run)| agent_run)
    }

    pub fn remove_test_run(&self, invocation_id: &str) -> Option<Arc<ServerTestRun>> {
        self.runs_by_invocation_id
            .remove(invocation_id)
            .map(|(_, run)| run)
    }
}

/// Shrinks the configured batch once fewer than `batch_size * ASSUMED_AGENT_COUNT`
/// tests are left, never going below one or above `batch_size`.
pub fn effective_batch_size(batch_size: usize, tests_left: usize) -> usize {
    let batch_size = batch_size.max(1);
    if tests_left / batch_size < ASSUMED_AGENT_COUNT {
        (tests_left / ASSUMED_AGENT_COUNT).clamp(1, batch_size)
    } else {
        batch_size
    }
}
