use crate::model::types::TestOutcome;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bookkeeping for one invocation, filled in at start and completed at finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestInvocationStats {
    pub invocation_id: String,
    pub invoker_id: String,
    pub test_assembly_path: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_tests: usize,
    pub worker_count: usize,
}

/// One terminal result of a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub invocation_id: String,
    pub agent_id: String,
    pub outcome: TestOutcome,
    pub duration_ms: Option<u64>,
}

/// Rolling history of a test plus the averages derived from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRunStats {
    pub test_full_name: String,
    #[serde(default)]
    pub recent_results: Vec<TestRunResult>,
    pub average_duration_ms: Option<f64>,
    pub average_successful_duration_ms: Option<f64>,
}

impl TestRunStats {
    pub fn new(test_full_name: impl Into<String>) -> Self {
        Self {
            test_full_name: test_full_name.into(),
            ..Self::default()
        }
    }

    /// Recomputes both averages from `recent_results`.
    pub fn recompute_averages(&mut self) {
        self.average_duration_ms = mean(self.recent_results.iter().filter_map(|r| r.duration_ms));
        self.average_successful_duration_ms = mean(
            self.recent_results
                .iter()
                .filter(|r| r.outcome == TestOutcome::Passed)
                .filter_map(|r| r.duration_ms),
        );
    }

    /// Best estimate of how long this test takes, if any duration was ever seen.
    pub fn expected_duration_ms(&self) -> Option<f64> {
        self.average_successful_duration_ms
            .or(self.average_duration_ms)
    }
}

fn mean(values: impl Iterator<Item = u64>) -> Option<f64> {
    let (sum, count) = values.fold((0u64, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum as f64 / count as f64)
}

/// On-disk layout of `stats.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsFile {
    #[serde(default)]
    pub invocation_stats: Vec<TestInvocationStats>,
    #[serde(default)]
    pub test_stats: Vec<TestRunStats>,
}
