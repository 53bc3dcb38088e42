//! Statistics Tests
//!
//! ## Test Scopes
//! - **Averages**: Successful vs. overall duration means.
//! - **Invocation records**: Start/finish bookkeeping and the file flush.
//! - **Loading**: Missing and corrupt files.

use super::repo::{STATS_FILE_NAME, StatRepo};
use super::types::*;
use super::{MAX_RECENT_RESULTS, StatsService};
use crate::model::types::TestOutcome;

use chrono::Duration;
use tempfile::TempDir;

// ============================================================
// TEST 1: Averages
// ============================================================

#[test]
fn test_averages_split_successful_from_all() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    let stats = StatsService::new(dir.path());

    // ACT
    stats.record_test_result("inv-1", "Agent_a_0", "suite::t", TestOutcome::Passed, Some(Duration::milliseconds(100)));
    stats.record_test_result("inv-1", "Agent_a_0", "suite::t", TestOutcome::Failed, Some(Duration::milliseconds(400)));
    stats.record_test_result("inv-1", "Agent_a_0", "suite::t", TestOutcome::Passed, None);

    // ASSERT
    let summary = stats.repo().test_stats("suite::t").unwrap();
    assert_eq!(summary.recent_results.len(), 3);
    assert_eq!(summary.average_duration_ms, Some(250.0));
    assert_eq!(summary.average_successful_duration_ms, Some(100.0));
    assert_eq!(summary.expected_duration_ms(), Some(100.0));
}

#[test]
fn test_expected_duration_falls_back_to_overall_average() {
    let mut summary = TestRunStats::new("suite::t");
    summary.recent_results.push(TestRunResult {
        invocation_id: "inv-1".to_string(),
        agent_id: "Agent_a_0".to_string(),
        outcome: TestOutcome::Failed,
        duration_ms: Some(80),
    });

    summary.recompute_averages();

    assert_eq!(summary.average_successful_duration_ms, None);
    assert_eq!(summary.expected_duration_ms(), Some(80.0));
}

#[test]
fn test_recent_results_are_capped() {
    let dir = TempDir::new().unwrap();
    let stats = StatsService::new(dir.path());

    for i in 0..(MAX_RECENT_RESULTS + 5) {
        stats.record_test_result(&format!("inv-{}", i), "Agent_a_0", "suite::t", TestOutcome::Passed, Some(Duration::milliseconds(10)));
    }

    let summary = stats.repo().test_stats("suite::t").unwrap();
    assert_eq!(summary.recent_results.len(), MAX_RECENT_RESULTS);
    assert_eq!(summary.recent_results[0].invocation_id, "inv-5");
}

// ============================================================
// TEST 2: Invocation records
// ============================================================

#[tokio::test]
async fn test_invocation_finish_counts_tests_and_workers_and_writes_file() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    let stats = StatsService::new(dir.path());
    stats.record_invocation_start("inv-1", "Invoker_1", "deps/suite");
    stats.record_test_result("inv-1", "Agent_a_0", "suite::one", TestOutcome::Passed, Some(Duration::milliseconds(5)));
    stats.record_test_result("inv-1", "Agent_a_1", "suite::two", TestOutcome::Passed, Some(Duration::milliseconds(5)));
    stats.record_test_result("inv-1", "Agent_a_1", "suite::three", TestOutcome::Failed, Some(Duration::milliseconds(5)));
    stats.record_test_result("inv-2", "Agent_b_0", "suite::one", TestOutcome::Passed, Some(Duration::milliseconds(5)));

    // ASSERT: nothing written until the invocation finishes
    assert!(!dir.path().join(STATS_FILE_NAME).exists());

    // ACT
    stats.record_invocation_finish("inv-1").await;

    // ASSERT
    let record = stats.repo().invocation("inv-1").unwrap();
    assert!(record.finished_at.is_some());
    assert_eq!(record.total_tests, 3);
    assert_eq!(record.worker_count, 2);

    let bytes = std::fs::read(dir.path().join(STATS_FILE_NAME)).unwrap();
    let file: StatsFile = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(file.invocation_stats.len(), 1);
    assert_eq!(file.test_stats.len(), 3);
    assert_eq!(file.test_stats[0].test_full_name, "suite::one");
}

#[test]
fn test_invocation_start_is_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let stats = StatsService::new(dir.path());

    stats.record_invocation_start("inv-1", "Invoker_1", "deps/suite");
    let first = stats.repo().invocation("inv-1").unwrap();
    stats.record_invocation_start("inv-1", "Invoker_other", "other");

    assert_eq!(stats.repo().invocation("inv-1").unwrap(), first);
}

#[tokio::test]
async fn test_finish_of_unknown_invocation_is_ignored() {
    let dir = TempDir::new().unwrap();
    let stats = StatsService::new(dir.path());

    stats.record_invocation_finish("missing").await;

    assert!(stats.repo().invocation("missing").is_none());
    assert!(!dir.path().join(STATS_FILE_NAME).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_finishes_write_every_invocation_while_results_keep_arriving() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    let stats = StatsService::new(dir.path());
    let invocations: Vec<String> = (0..8).map(|i| format!("inv-{}", i)).collect();
    for id in &invocations {
        stats.record_invocation_start(id, "Invoker_1", "deps/suite");
        stats.record_test_result(id, "Agent_a_0", &format!("suite::{}", id), TestOutcome::Passed, Some(Duration::milliseconds(3)));
    }

    // ACT: finishes race each other and a thread that keeps recording results
    let recorder = {
        let stats = stats.clone();
        std::thread::spawn(move || {
            for n in 0..200 {
                stats.record_test_result("inv-live", "Agent_b_0", &format!("suite::live_{}", n % 10), TestOutcome::Passed, None);
            }
        })
    };
    let handles: Vec<_> = invocations
        .iter()
        .cloned()
        .map(|id| {
            let stats = stats.clone();
            tokio::spawn(async move { stats.record_invocation_finish(&id).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }
    recorder.join().unwrap();

    // ASSERT
    let bytes = std::fs::read(dir.path().join(STATS_FILE_NAME)).unwrap();
    let file: StatsFile = serde_json::from_slice(&bytes).unwrap();
    let finished: Vec<&str> = file
        .invocation_stats
        .iter()
        .filter(|i| i.finished_at.is_some())
        .map(|i| i.invocation_id.as_str())
        .collect();
    assert_eq!(finished.len(), invocations.len());
    assert!(!dir.path().join(format!("{}.tmp", STATS_FILE_NAME)).exists());
    assert_eq!(stats.repo().test_stats("suite::live_0").unwrap().recent_results.len(), 20);
}

#[tokio::test]
async fn test_failed_flush_leaves_the_store_usable() {
    // ARRANGE: the state folder path is taken by a plain file
    let dir = TempDir::new().unwrap();
    let blocked = dir.path().join("state");
    std::fs::write(&blocked, b"not a folder").unwrap();
    let stats = StatsService::new(&blocked);
    stats.record_invocation_start("inv-1", "Invoker_1", "deps/suite");

    // ACT
    let flushed = stats.repo().flush().await;
    stats.record_test_result("inv-1", "Agent_a_0", "suite::one", TestOutcome::Passed, Some(Duration::milliseconds(7)));
    stats.record_invocation_finish("inv-1").await;

    // ASSERT
    assert!(flushed.is_err());
    let record = stats.repo().invocation("inv-1").unwrap();
    assert!(record.finished_at.is_some());
    assert_eq!(record.total_tests, 1);
}

// ============================================================
// TEST 3: Loading
// ============================================================

#[tokio::test]
async fn test_stats_survive_a_reload() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    {
        let stats = StatsService::new(dir.path());
        stats.record_invocation_start("inv-1", "Invoker_1", "deps/suite");
        stats.record_test_result("inv-1", "Agent_a_0", "suite::one", TestOutcome::Passed, Some(Duration::milliseconds(42)));
        stats.record_invocation_finish("inv-1").await;
    }

    // ACT
    let reloaded = StatsService::new(dir.path());
    let summaries = reloaded.test_summaries(["suite::one", "suite::unknown"]);

    // ASSERT
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries["suite::one"].average_successful_duration_ms, Some(42.0));
    assert_eq!(reloaded.repo().invocation("inv-1").unwrap().total_tests, 1);
}

#[test]
fn test_corrupt_file_yields_empty_stats() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(STATS_FILE_NAME), b"{ not json").unwrap();

    let repo = StatRepo::new(dir.path());

    assert!(repo.test_stats("suite::one").is_none());
    assert!(repo.invocation_results("inv-1").is_empty());
}
