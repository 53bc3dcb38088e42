//! Runner Tests
//!
//! ## Test Scopes
//! - **Output parsing**: `--list` output, outcomes and panic messages.
//! - **Process driving**: A shell script standing in for a libtest binary.

use super::libtest::{LibtestRunner, parse_test_list};
use super::*;
use crate::model::types::TestOutcome;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingSink {
    updates: Mutex<Vec<(String, StatusUpdateType)>>,
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn notify(
        &self,
        _run: &RunningTestData,
        test: &TestSpec,
        update_type: StatusUpdateType,
        _message: Option<String>,
    ) {
        self.updates
            .lock()
            .push((test.full_test_name.clone(), update_type));
    }
}

const FAKE_SUITE: &str = r#"#!/bin/sh
case "$*" in
  *"--list"*"--ignored"*) echo "suite::slow: test" ;;
  *"--list"*) printf 'suite::ok: test\nsuite::bad: test\nsuite::slow: test\nbench_x: benchmark\n' ;;
  *"--exact suite::ok "*) echo "running 1 test"; echo "test suite::ok ... ok"; exit 0 ;;
  *"--exact suite::bad "*) echo "running 1 test"; echo "thread 'suite::bad' panicked at src/lib.rs:1:1:" >&2; echo "boom" >&2; exit 101 ;;
  *"--exact suite::slow "*) echo "running 1 test"; echo "test suite::slow ... ignored"; exit 0 ;;
  *"--exact suite::hang "*) sleep 30 ;;
  *) echo "running 0 tests"; exit 0 ;;
esac
"#;

#[cfg(unix)]
fn fake_workspace() -> (TempDir, LocalWorkspace) {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let script = dir.path().join("fake_suite.sh");
    std::fs::write(&script, FAKE_SUITE).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut spec = crate::model::tests::sample_invocation("inv-1");
    spec.test_assembly_path = "fake_suite.sh".to_string();
    let workspace = LocalWorkspace {
        spec,
        base_path: dir.path().to_path_buf(),
    };
    (dir, workspace)
}

fn running(workspace: &LocalWorkspace, names: &[&str]) -> RunningTestData {
    RunningTestData {
        invocation: workspace.spec.clone(),
        request_id: "req-1".to_string(),
        tests: names.iter().map(|n| TestSpec::from_path(n)).collect(),
        cancel: CancellationToken::new(),
    }
}

// ============================================================
// TEST 1: Output parsing
// ============================================================

#[test]
fn test_parse_test_list_keeps_only_tests() {
    let stdout = "a::b: test\nc::d: test\nbench_it: benchmark\n\n3 tests, 1 benchmarks\n";

    let names = parse_test_list(stdout);

    assert_eq!(names, vec!["a::b".to_string(), "c::d".to_string()]);
}

// ============================================================
// TEST 2: Process driving
// ============================================================

#[cfg(unix)]
#[tokio::test]
async fn test_enumerate_skips_ignored_tests() {
    let (_dir, workspace) = fake_workspace();

    let tests = LibtestRunner::new().enumerate_tests(&workspace).await.unwrap();

    let names: Vec<_> = tests.iter().map(|t| t.full_test_name.as_str()).collect();
    assert_eq!(names, vec!["suite::ok", "suite::bad"]);
    assert_eq!(tests[0].method_name, "ok");
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_tests_maps_exit_status_to_outcome() {
    // ARRANGE
    let (_dir, workspace) = fake_workspace();
    let run = running(&workspace, &["suite::ok", "suite::bad", "suite::slow", "suite::missing"]);
    let sink = RecordingSink::default();

    // ACT
    let result = LibtestRunner::new()
        .run_tests(&run, &workspace, &sink)
        .await
        .unwrap();

    // ASSERT
    let outcomes: Vec<_> = result.test_results.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            Some(TestOutcome::Passed),
            Some(TestOutcome::Failed),
            Some(TestOutcome::Skipped),
            Some(TestOutcome::Failed),
        ]
    );

    let bad = &result.test_results[1];
    assert!(bad.error_message.as_deref().unwrap().contains("panicked at"));
    assert!(bad.error_message.as_deref().unwrap().contains("boom"));
    assert!(bad.start_date_time.is_some() && bad.end_date_time.is_some());

    let missing = &result.test_results[3];
    assert!(missing.error_message.as_deref().unwrap().contains("not found"));

    let updates = sink.updates.lock().clone();
    assert_eq!(updates.len(), 8);
    assert_eq!(updates[0], ("suite::ok".to_string(), StatusUpdateType::Started));
    assert_eq!(updates[3], ("suite::bad".to_string(), StatusUpdateType::Failed));
}

#[cfg(unix)]
#[tokio::test]
async fn test_cancel_stops_a_running_batch() {
    // ARRANGE
    let (_dir, workspace) = fake_workspace();
    let run = running(&workspace, &["suite::hang", "suite::ok"]);
    let sink = Arc::new(RecordingSink::default());

    // ACT
    let cancel = run.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let started = std::time::Instant::now();
    let result = LibtestRunner::new().run_tests(&run, &workspace, sink.as_ref()).await;

    // ASSERT
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(sink.updates.lock().len(), 1);
}
