use crate::model::types::{TestInvocationExecutionInfo, TestOutcome};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;

/// Writes an invocation's aggregate result somewhere durable.
#[async_trait]
pub trait ResultSerializer: Send + Sync {
    async fn serialize(&self, path: &Path, results: &TestInvocationExecutionInfo) -> Result<()>;
}

#[derive(Serialize)]
struct ResultSummary {
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
}

#[derive(Serialize)]
struct ResultFile<'a> {
    summary: ResultSummary,
    #[serde(flatten)]
    results: &'a TestInvocationExecutionInfo,
}

/// Pretty-printed JSON: a summary block followed by the invocation spec and
/// every test record.
#[derive(Debug, Default, Clone)]
pub struct JsonResultSerializer;

#[async_trait]
impl ResultSerializer for JsonResultSerializer {
    async fn serialize(&self, path: &Path, results: &TestInvocationExecutionInfo) -> Result<()> {
        let file = ResultFile {
            summary: ResultSummary {
                total: results.tests.len(),
                passed: results.count_outcome(TestOutcome::Passed),
                failed: results.count_outcome(TestOutcome::Failed),
                skipped: results.count_outcome(TestOutcome::Skipped),
            },
            results,
        };
        let json = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write results to {:?}", path))?;

        tracing::info!(
            "Wrote {} results to {:?} ({} passed, {} failed, {} skipped)",
            file.summary.total,
            path,
            file.summary.passed,
            file.summary.failed,
            file.summary.skipped
        );
        Ok(())
    }
}
