use crate::model::types::{InvocationSpec, TestExecutionInfo, TestPartSpec};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("An invocation with id {0} is already running")]
    DuplicateInvocation(String),
    #[error("No running invocation with id {0}")]
    UnknownInvocation(String),
}

/// One batch handed to one agent.
#[derive(Debug)]
pub struct AgentDelegatedTestRun {
    pub agent_id: String,
    /// Unique per dispatch.
    pub request_id: String,
    pub partial_tests: TestPartSpec,
    pub dispatched_at: Instant,
    last_heartbeat: Mutex<Instant>,
    last_test_activity: Mutex<Instant>,
}

impl AgentDelegatedTestRun {
    pub fn new(agent_id: &str, request_id: String, partial_tests: TestPartSpec) -> Self {
        let now = Instant::now();
        Self {
            agent_id: agent_id.to_string(),
            request_id,
            partial_tests,
            dispatched_at: now,
            last_heartbeat: Mutex::new(now),
            last_test_activity: Mutex::new(now),
        }
    }

    pub fn invocation_id(&self) -> &str {
        &self.partial_tests.invocation_spec.id
    }

    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn touch_activity(&self) {
        *self.last_test_activity.lock() = Instant::now();
    }

    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn activity_age(&self) -> Duration {
        self.last_test_activity.lock().elapsed()
    }
}

/// The server's view of one invocation.
///
/// `tests_by_full_name` holds every test; `processed_by_full_name` the terminal
/// ones. The run is complete when both have the same size.
#[derive(Debug)]
pub struct ServerTestRun {
    pub spec: InvocationSpec,
    pub tests_by_full_name: DashMap<String, TestExecutionInfo>,
    pub processed_by_full_name: DashMap<String, TestExecutionInfo>,
    pub agent_runs_by_request_id: DashMap<String, Arc<AgentDelegatedTestRun>>,
    /// LIFO pool of tests waiting for an agent.
    pub(crate) tests_to_process: Mutex<Vec<TestExecutionInfo>>,
    pub started_at: OnceLock<DateTime<Utc>>,
    pub finished_at: OnceLock<DateTime<Utc>>,
    last_invoker_heartbeat: Mutex<Instant>,
}

impl ServerTestRun {
    pub fn new(
        spec: InvocationSpec,
        tests_by_full_name: DashMap<String, TestExecutionInfo>,
        processed_by_full_name: DashMap<String, TestExecutionInfo>,
        tests_to_process: Vec<TestExecutionInfo>,
    ) -> Self {
        Self {
            spec,
            tests_by_full_name,
            processed_by_full_name,
            agent_runs_by_request_id: DashMap::new(),
            tests_to_process: Mutex::new(tests_to_process),
            started_at: OnceLock::new(),
            finished_at: OnceLock::new(),
            last_invoker_heartbeat: Mutex::new(Instant::now()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.tests_to_process.lock().len()
    }

    pub fn is_complete(&self) -> bool {
        self.tests_by_full_name.len() == self.processed_by_full_name.len()
    }

    pub fn touch_invoker_heartbeat(&self) {
        *self.last_invoker_heartbeat.lock() = Instant::now();
    }

    pub fn invoker_heartbeat_age(&self) -> Duration {
        self.last_invoker_heartbeat.lock().elapsed()
    }
}
