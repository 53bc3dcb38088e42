use crate::model::types::{InvocationSpec, TestExecutionInfo};
use crate::runner::TestEnumerator;
use crate::stats::StatsService;
use crate::workspace::handler::WorkspaceHandler;

use anyhow::Result;
use std::sync::Arc;

/// Fetches an invocation's build output and lists its tests in dispatch order.
pub struct TestRetriever {
    workspace: Arc<WorkspaceHandler>,
    enumerator: Arc<dyn TestEnumerator>,
    stats: Arc<StatsService>,
}

impl TestRetriever {
    pub fn new(
        workspace: Arc<WorkspaceHandler>,
        enumerator: Arc<dyn TestEnumerator>,
        stats: Arc<StatsService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            workspace,
            enumerator,
            stats,
        })
    }

    /// Returns the tests sorted by ascending expected duration. The pool pops
    /// from the back, so the slowest tests go out first.
    pub async fn retrieve_tests_to_execute(
        &self,
        spec: &InvocationSpec,
    ) -> Result<Vec<TestExecutionInfo>> {
        let workspace = self.workspace.create_local_workspace(spec).await?;
        let specs = self.enumerator.enumerate_tests(&workspace).await?;

        let mut tests: Vec<TestExecutionInfo> =
            specs.into_iter().map(TestExecutionInfo::pending).collect();

        let summaries = self
            .stats
            .test_summaries(tests.iter().map(|t| t.full_name()));

        if !summaries.is_empty() {
            let overall = summaries
                .values()
                .map(|s| s.expected_duration_ms().unwrap_or(0.0))
                .sum::<f64>()
                / summaries.len() as f64;

            let expected = |t: &TestExecutionInfo| {
                summaries
                    .get(t.full_name())
                    .and_then(|s| s.expected_duration_ms())
                    .unwrap_or(overall)
            };
            tests.sort_by(|a, b| expected(a).total_cmp(&expected(b)));
        }

        Ok(tests)
    }
}
