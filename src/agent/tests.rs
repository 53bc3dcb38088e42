//! Agent Tests
//!
//! ## Test Scopes
//! - **Reporting**: Results, progress and the ready announcement after a batch.
//! - **Failures**: Runner errors and tests the runner never reported.
//! - **Single batch**: Rejection while busy, cancellation and heartbeats.

use super::worker::{AgentWorker, NOT_RUN_MESSAGE};
use crate::bus::testing::RecordingBus;
use crate::config::WorkspaceConfig;
use crate::model::messages::*;
use crate::model::tests::{sample_invocation, sample_specs};
use crate::model::types::*;
use crate::runner::{ProgressSink, RunningTestData, TestRunner, TestRunnerResult};
use crate::workspace::handler::WorkspaceHandler;
use crate::workspace::{FileTransfer, LocalWorkspace};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const AGENT: &str = "Agent_a_0";

#[derive(Clone, Copy)]
enum Behavior {
    ReportAll,
    SkipLast,
    Fail,
    WaitForCancel,
}

struct FakeRunner(Behavior);

#[async_trait]
impl TestRunner for FakeRunner {
    async fn run_tests(
        &self,
        run: &RunningTestData,
        _workspace: &LocalWorkspace,
        progress: &dyn ProgressSink,
    ) -> Result<TestRunnerResult> {
        let tests = match self.0 {
            Behavior::Fail => bail!("runner exploded"),
            Behavior::WaitForCancel => {
                run.cancel.cancelled().await;
                bail!("Test run {} was cancelled", run.request_id);
            }
            Behavior::ReportAll => &run.tests[..],
            Behavior::SkipLast => &run.tests[..run.tests.len() - 1],
        };

        let mut result = TestRunnerResult::default();
        for test in tests {
            progress
                .notify(run, test, StatusUpdateType::Started, None)
                .await;
            let mut info = TestExecutionInfo::pending(test.clone());
            info.outcome = Some(TestOutcome::Passed);
            info.start_date_time = Some(Utc::now());
            info.end_date_time = Some(Utc::now());
            info.standard_output = Some(format!("out {}", test.full_test_name));
            progress
                .notify(run, test, StatusUpdateType::Finished, None)
                .await;
            result.test_results.push(info);
        }
        Ok(result)
    }
}

struct MarkerTransfer;

#[async_trait]
impl FileTransfer for MarkerTransfer {
    async fn copy_remote_files(&self, _source: &RemotePathInfo, local_dest: &Path) -> Result<()> {
        tokio::fs::write(local_dest.join("copied"), b"").await?;
        Ok(())
    }
}

fn worker(dir: &TempDir, bus: &Arc<RecordingBus>, behavior: Behavior) -> Arc<AgentWorker> {
    let workspace = WorkspaceHandler::new(
        WorkspaceConfig {
            working_folder: dir.path().to_path_buf(),
            ..WorkspaceConfig::default()
        },
        Arc::new(MarkerTransfer),
    );
    AgentWorker::new(
        AGENT,
        "Server",
        bus.clone(),
        workspace,
        Arc::new(FakeRunner(behavior)),
        Duration::from_millis(20),
    )
}

fn run_message(request_id: &str) -> RunAgentTests {
    RunAgentTests {
        request_id: request_id.to_string(),
        invocation_spec: sample_invocation("inv-1"),
        tests_to_run: sample_specs(3),
    }
}

fn reports(bus: &RecordingBus) -> Vec<AgentTestsComplete> {
    bus.sent_of::<AgentTestsComplete>()
        .into_iter()
        .map(|(recipient, report)| {
            assert_eq!(recipient, "Server");
            report
        })
        .collect()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================
// TEST 1: Reporting
// ============================================================

#[tokio::test]
async fn test_batch_results_are_reported_then_ready() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    let bus = RecordingBus::new(AGENT);
    let worker = worker(&dir, &bus, Behavior::ReportAll);

    // ACT
    worker.handle_run_tests(run_message("req-1")).await;

    // ASSERT
    let reports = reports(&bus);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].request_id, "req-1");
    assert_eq!(reports[0].invocation_id, "inv-1");
    assert!(reports[0].error.is_none());
    assert_eq!(reports[0].test_results.len(), 3);
    assert!(reports[0]
        .test_results
        .iter()
        .all(|r| r.agent_id.as_deref() == Some(AGENT)));

    let updates = bus.sent_of::<AgentTestStatusUpdate>();
    assert_eq!(updates.len(), 12);
    assert_eq!(
        updates.iter().filter(|(to, _)| to == "Invoker_inv-1").count(),
        6
    );
    assert_eq!(updates.iter().filter(|(to, _)| to == "Server").count(), 6);
    assert!(updates.iter().all(|(_, u)| u.agent_run_request_id == "req-1"));

    let tags: Vec<String> = bus.sent().into_iter().map(|m| m.type_tag).collect();
    assert_eq!(tags.last().map(String::as_str), Some("AgentReady"));
    let complete_at = tags.iter().position(|t| t == "AgentTestsComplete").unwrap();
    assert_eq!(complete_at, tags.len() - 2);
    assert!(worker.current_request_id().is_none());
}

#[tokio::test]
async fn test_unreported_test_is_failed_as_not_run() {
    let dir = TempDir::new().unwrap();
    let bus = RecordingBus::new(AGENT);
    let worker = worker(&dir, &bus, Behavior::SkipLast);

    worker.handle_run_tests(run_message("req-1")).await;

    let reports = reports(&bus);
    let results = &reports[0].test_results;
    assert_eq!(results.len(), 3);

    let missing = results
        .iter()
        .find(|r| r.full_name() == "suite::test_2")
        .unwrap();
    assert_eq!(missing.outcome, Some(TestOutcome::Failed));
    assert_eq!(missing.error_message.as_deref(), Some(NOT_RUN_MESSAGE));
    assert_eq!(missing.agent_id.as_deref(), Some(AGENT));
    let output = missing.standard_output.as_deref().unwrap();
    assert!(output.contains("out suite::test_0"));
    assert!(output.contains("out suite::test_1"));
}

#[tokio::test]
async fn test_runner_error_becomes_batch_error() {
    let dir = TempDir::new().unwrap();
    let bus = RecordingBus::new(AGENT);
    let worker = worker(&dir, &bus, Behavior::Fail);

    worker.handle_run_tests(run_message("req-1")).await;

    let reports = reports(&bus);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].error.as_deref(), Some("runner exploded"));
    assert!(reports[0].test_results.is_empty());
    assert_eq!(bus.sent_of::<AgentReady>().len(), 1);
}

// ============================================================
// TEST 2: One batch at a time
// ============================================================

#[tokio::test]
async fn test_busy_worker_rejects_then_cancels() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    let bus = RecordingBus::new(AGENT);
    let worker = worker(&dir, &bus, Behavior::WaitForCancel);
    worker.init().await.unwrap();

    let running = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.handle_run_tests(run_message("req-1")).await })
    };
    wait_until(|| worker.current_request_id().as_deref() == Some("req-1")).await;
    wait_until(|| !bus.sent_of::<AgentTestRunHeartbeat>().is_empty()).await;

    // ACT: a second batch while busy
    worker.handle_run_tests(run_message("req-2")).await;

    // ASSERT
    let rejected = reports(&bus);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].request_id, "req-2");
    assert_eq!(
        rejected[0].error.as_deref(),
        Some("Agent Agent_a_0 can't accept this run request when another run (req-1) is in progress.")
    );

    // ACT: busy workers stay quiet, foreign cancels are ignored
    bus.deliver(
        "Server",
        &RequestAgents {
            invocation_spec: sample_invocation("inv-2"),
        },
    )
    .await;
    bus.deliver(
        "Server",
        &CancelAgentTests {
            request_id: "req-other".to_string(),
        },
    )
    .await;
    assert!(bus.sent_of::<AgentReady>().is_empty());
    assert_eq!(worker.current_request_id().as_deref(), Some("req-1"));

    // ACT: cancel the running batch
    bus.deliver(
        "Server",
        &CancelAgentTests {
            request_id: "req-1".to_string(),
        },
    )
    .await;
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap();

    // ASSERT
    let reports = reports(&bus);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1].request_id, "req-1");
    assert!(reports[1].error.as_deref().unwrap().contains("cancelled"));
    assert_eq!(bus.sent_of::<AgentReady>().len(), 1);
    assert!(worker.current_request_id().is_none());

    let beats = bus.sent_of::<AgentTestRunHeartbeat>();
    assert!(beats
        .iter()
        .all(|(to, beat)| to == "Server" && beat.request_id == "req-1"));
    let settled = beats.len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.sent_of::<AgentTestRunHeartbeat>().len(), settled);
}

#[tokio::test]
async fn test_idle_worker_answers_agent_requests() {
    let dir = TempDir::new().unwrap();
    let bus = RecordingBus::new(AGENT);
    let worker = worker(&dir, &bus, Behavior::ReportAll);
    worker.init().await.unwrap();

    bus.deliver(
        "Server",
        &RequestAgents {
            invocation_spec: sample_invocation("inv-1"),
        },
    )
    .await;
    bus.deliver(
        "Server",
        &ServerRegistered {
            server_id: "Server".to_string(),
        },
    )
    .await;

    let ready = bus.sent_of::<AgentReady>();
    assert_eq!(ready.len(), 2);
    assert!(ready
        .iter()
        .all(|(to, msg)| to == "Server" && msg.agent_id == AGENT));
}
