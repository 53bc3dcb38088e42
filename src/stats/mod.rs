//! Test Statistics
//!
//! Keeps a history of test durations and invocation records across runs so the
//! scheduler can order work by expected duration.
//!
//! ## Submodules
//! - **`types`**: Persisted record shapes.
//! - **`repo`**: The `stats.json` store.

pub mod repo;
pub mod types;

#[cfg(test)]
mod tests;

use crate::model::types::TestOutcome;
use repo::StatRepo;
use types::*;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Results kept per test; older ones are dropped first.
pub const MAX_RECENT_RESULTS: usize = 20;

/// Records invocation and test outcomes, and answers duration queries.
pub struct StatsService {
    repo: StatRepo,
}

impl StatsService {
    pub fn new(state_folder: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            repo: StatRepo::new(state_folder),
        })
    }

    pub fn repo(&self) -> &StatRepo {
        &self.repo
    }

    /// Creates the invocation record unless one already exists.
    pub fn record_invocation_start(
        &self,
        invocation_id: &str,
        invoker_id: &str,
        test_assembly_path: &str,
    ) {
        let invocation = self
            .repo
            .invocation(invocation_id)
            .unwrap_or_else(|| TestInvocationStats {
                invocation_id: invocation_id.to_string(),
                invoker_id: invoker_id.to_string(),
                test_assembly_path: test_assembly_path.to_string(),
                started_at: Utc::now(),
                finished_at: None,
                total_tests: 0,
                worker_count: 0,
            });
        self.repo.save_invocation(invocation);
    }

    /// Stamps the finish time, derives totals from the recorded results and
    /// writes the stats file.
    pub async fn record_invocation_finish(&self, invocation_id: &str) {
        let Some(mut invocation) = self.repo.invocation(invocation_id) else {
            tracing::debug!("No stats record for invocation {}", invocation_id);
            return;
        };

        let results = self.repo.invocation_results(invocation_id);
        invocation.finished_at = Some(Utc::now());
        invocation.total_tests = results.len();
        invocation.worker_count = results
            .iter()
            .map(|r| r.agent_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        self.repo.save_invocation(invocation);
        if let Err(e) = self.repo.flush().await {
            tracing::error!("Failed to write stats file {:?}: {:#}", self.repo.file_path(), e);
        }
    }

    pub fn record_test_result(
        &self,
        invocation_id: &str,
        agent_id: &str,
        full_name: &str,
        outcome: TestOutcome,
        duration: Option<chrono::Duration>,
    ) {
        let mut stats = self
            .repo
            .test_stats(full_name)
            .unwrap_or_else(|| TestRunStats::new(full_name));

        stats.recent_results.push(TestRunResult {
            invocation_id: invocation_id.to_string(),
            agent_id: agent_id.to_string(),
            outcome,
            duration_ms: duration.and_then(|d| u64::try_from(d.num_milliseconds()).ok()),
        });
        if stats.recent_results.len() > MAX_RECENT_RESULTS {
            let excess = stats.recent_results.len() - MAX_RECENT_RESULTS;
            stats.recent_results.drain(..excess);
        }
        stats.recompute_averages();

        self.repo.save_test(stats);
    }

    pub fn test_summaries<'a>(
        &self,
        full_names: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, TestRunStats> {
        self.repo.test_stats_for(full_names)
    }
}
