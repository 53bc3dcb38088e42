//! Test Runner Abstractions
//!
//! The scheduler and the agents never talk to a test framework directly; they go
//! through the two traits below. `libtest` provides the implementation for Rust
//! test binaries built by `cargo test --no-run`.
//!
//! ## Submodules
//! - **`libtest`**: Enumerates and runs tests of a libtest harness binary.

pub mod libtest;

#[cfg(test)]
mod tests;

use crate::model::messages::StatusUpdateType;
use crate::model::types::{InvocationSpec, TestExecutionInfo, TestSpec};
use crate::workspace::LocalWorkspace;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Lists the runnable tests of a workspace, skipping ignored ones.
#[async_trait]
pub trait TestEnumerator: Send + Sync {
    async fn enumerate_tests(&self, workspace: &LocalWorkspace) -> Result<Vec<TestSpec>>;
}

/// A batch currently executing on a worker.
#[derive(Debug, Clone)]
pub struct RunningTestData {
    pub invocation: InvocationSpec,
    pub request_id: String,
    pub tests: Vec<TestSpec>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct TestRunnerResult {
    pub test_results: Vec<TestExecutionInfo>,
}

/// Receives per-test progress while a batch runs.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn notify(
        &self,
        run: &RunningTestData,
        test: &TestSpec,
        update_type: StatusUpdateType,
        message: Option<String>,
    );
}

/// Runs a batch inside a prepared workspace.
///
/// Should return one result per requested test. The caller fails whatever is
/// missing. Cancellation of `run.cancel` must stop the batch promptly.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(
        &self,
        run: &RunningTestData,
        workspace: &LocalWorkspace,
        progress: &dyn ProgressSink,
    ) -> Result<TestRunnerResult>;
}
