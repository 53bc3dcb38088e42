use super::*;
use crate::model::types::TestOutcome;

use anyhow::{Context, bail};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Drives a libtest harness binary: one child process per test.
#[derive(Debug, Clone, Default)]
pub struct LibtestRunner;

impl LibtestRunner {
    pub fn new() -> Self {
        Self
    }

    async fn list(binary: &Path, cwd: &Path, ignored: bool) -> Result<Vec<String>> {
        let mut command = Command::new(binary);
        command
            .args(["--list", "--format", "terse"])
            .current_dir(cwd)
            .kill_on_drop(true);
        if ignored {
            command.arg("--ignored");
        }

        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to start {:?}", binary))?;
        if !output.status.success() {
            bail!(
                "Listing tests in {:?} failed ({}): {}",
                binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(parse_test_list(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn run_one(
        binary: &Path,
        cwd: &Path,
        test: &TestSpec,
        cancel: &CancellationToken,
    ) -> Result<TestExecutionInfo> {
        let child = Command::new(binary)
            .args([
                "--exact",
                &test.full_test_name,
                "--test-threads",
                "1",
                "--nocapture",
            ])
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {:?}", binary))?;

        let mut info = TestExecutionInfo::pending(test.clone());
        info.start_date_time = Some(Utc::now());

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => bail!("Test run cancelled while running {}", test.full_test_name),
        };

        info.end_date_time = Some(Utc::now());
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        info.outcome = Some(outcome_from(&test.full_test_name, output.status.success(), &stdout));
        if info.outcome == Some(TestOutcome::Failed) {
            info.error_message = Some(if output.status.success() {
                format!("Test {} was not found in {:?}", test.full_test_name, binary)
            } else {
                panic_message(&stderr)
                    .unwrap_or_else(|| format!("Test process exited with {}", output.status))
            });
            info.stack_trace = stack_backtrace(&stderr);
        }
        info.standard_output = (!stdout.is_empty()).then_some(stdout);
        info.error_output = (!stderr.is_empty()).then_some(stderr);

        Ok(info)
    }
}

#[async_trait]
impl TestEnumerator for LibtestRunner {
    async fn enumerate_tests(&self, workspace: &LocalWorkspace) -> Result<Vec<TestSpec>> {
        let binary = workspace.test_binary();
        let all = Self::list(&binary, &workspace.base_path, false).await?;
        let ignored: HashSet<String> = Self::list(&binary, &workspace.base_path, true)
            .await?
            .into_iter()
            .collect();

        let tests: Vec<TestSpec> = all
            .iter()
            .filter(|name| !ignored.contains(*name))
            .map(|name| TestSpec::from_path(name))
            .collect();

        tracing::info!(
            "Enumerated {} tests in {:?} ({} ignored)",
            tests.len(),
            binary,
            ignored.len()
        );
        Ok(tests)
    }
}

#[async_trait]
impl TestRunner for LibtestRunner {
    async fn run_tests(
        &self,
        run: &RunningTestData,
        workspace: &LocalWorkspace,
        progress: &dyn ProgressSink,
    ) -> Result<TestRunnerResult> {
        let binary = workspace.test_binary();
        let mut result = TestRunnerResult::default();

        for test in &run.tests {
            if run.cancel.is_cancelled() {
                bail!("Test run {} was cancelled", run.request_id);
            }

            progress
                .notify(run, test, StatusUpdateType::Started, None)
                .await;

            let info = Self::run_one(&binary, &workspace.base_path, test, &run.cancel).await?;

            let update_type = match info.outcome {
                Some(TestOutcome::Failed) => StatusUpdateType::Failed,
                _ => StatusUpdateType::Finished,
            };
            progress
                .notify(run, test, update_type, info.error_message.clone())
                .await;

            result.test_results.push(info);
        }

        Ok(result)
    }
}

/// Parses `--list --format terse` output: one `name: test` line per test.
pub fn parse_test_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_suffix(": test"))
        .map(str::to_string)
        .collect()
}

fn outcome_from(full_name: &str, success: bool, stdout: &str) -> TestOutcome {
    if !success {
        TestOutcome::Failed
    } else if stdout.contains(&format!("test {} ... ignored", full_name)) {
        TestOutcome::Skipped
    } else if stdout.contains("running 0 tests") {
        // --exact matched nothing.
        TestOutcome::Failed
    } else {
        TestOutcome::Passed
    }
}

/// First panic line plus the message lines that follow it.
fn panic_message(stderr: &str) -> Option<String> {
    let mut lines = stderr.lines().skip_while(|l| !l.contains("panicked at"));
    let header = lines.next()?;
    let body: Vec<&str> = lines
        .take_while(|l| !l.starts_with("note:") && !l.starts_with("stack backtrace:"))
        .collect();

    if body.is_empty() {
        Some(header.to_string())
    } else {
        Some(format!("{}\n{}", header, body.join("\n")))
    }
}

fn stack_backtrace(stderr: &str) -> Option<String> {
    let start = stderr.find("stack backtrace:")?;
    Some(stderr[start..].to_string())
}
