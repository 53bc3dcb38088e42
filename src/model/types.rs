use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a single test. `full_test_name` is the key within one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestSpec {
    pub test_name: String,
    pub full_test_name: String,
    pub class_name: String,
    pub method_name: String,
}

impl TestSpec {
    /// Builds a spec from a `::`-separated path such as `module::sub::test_fn`.
    pub fn from_path(full_test_name: &str) -> Self {
        let (class_name, method_name) = match full_test_name.rsplit_once("::") {
            Some((class, method)) => (class.to_string(), method.to_string()),
            None => (String::new(), full_test_name.to_string()),
        };

        Self {
            test_name: method_name.clone(),
            full_test_name: full_test_name.to_string(),
            class_name,
            method_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestOutcome::Passed => write!(f, "Passed"),
            TestOutcome::Failed => write!(f, "Failed"),
            TestOutcome::Skipped => write!(f, "Skipped"),
        }
    }
}

/// Mutable execution record for one test. `outcome == None` means pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecutionInfo {
    pub spec: TestSpec,
    pub agent_id: Option<String>,
    pub outcome: Option<TestOutcome>,
    pub start_date_time: Option<DateTime<Utc>>,
    pub end_date_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub standard_output: Option<String>,
    pub error_output: Option<String>,
    /// How many times the test has been run. 1 for a test that passes first go.
    pub attempt_count: u32,
}

impl TestExecutionInfo {
    pub fn pending(spec: TestSpec) -> Self {
        Self {
            spec,
            agent_id: None,
            outcome: None,
            start_date_time: None,
            end_date_time: None,
            error_message: None,
            stack_trace: None,
            standard_output: None,
            error_output: None,
            attempt_count: 0,
        }
    }

    pub fn full_name(&self) -> &str {
        &self.spec.full_test_name
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_date_time, self.end_date_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Marks the record failed at the current instant with the given message.
    pub fn fail_now(&mut self, agent_id: &str, message: impl Into<String>) {
        let now = Utc::now();
        self.outcome = Some(TestOutcome::Failed);
        self.error_message = Some(message.into());
        self.start_date_time = Some(now);
        self.end_date_time = Some(now);
        self.agent_id = Some(agent_id.to_string());
    }
}

/// Where to fetch a folder from: a host on the bus plus a path local to that host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePathInfo {
    pub host_id: String,
    pub source_path: String,
}

/// Everything the server and the agents need to know about one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationSpec {
    pub id: String,
    pub invoker_id: String,
    pub source_path: RemotePathInfo,
    /// Test binary path, relative to the root of `source_path`.
    pub test_assembly_path: String,
    pub max_retry_count: u32,
    pub test_inactivity_timeout_seconds: u64,
    pub requested_at: DateTime<Utc>,
}

/// A batch of tests from one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPartSpec {
    pub invocation_spec: InvocationSpec,
    pub tests_to_run: Vec<TestSpec>,
}

/// Aggregate result of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestInvocationExecutionInfo {
    pub spec: InvocationSpec,
    pub tests: Vec<TestExecutionInfo>,
}

impl TestInvocationExecutionInfo {
    pub fn count_outcome(&self, outcome: TestOutcome) -> usize {
        self.tests
            .iter()
            .filter(|t| t.outcome == Some(outcome))
            .count()
    }
}
