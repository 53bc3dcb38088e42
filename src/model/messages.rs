//! Wire Messages
//!
//! One struct per message type. Each carries a stable type tag used by the bus
//! to pick the deserialization target and the handler set on the receiving side.

use super::types::*;
use crate::bus::types::BusMessage;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Invoker → server: start a new invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeTests {
    pub invocation_id: String,
    pub source_path: RemotePathInfo,
    pub test_assembly_path: String,
    pub max_retry_count: u32,
    pub test_inactivity_timeout_seconds: u64,
}

impl BusMessage for InvokeTests {
    const TYPE_TAG: &'static str = "InvokeTests";
}

/// Server → all: an invocation has work waiting for idle agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAgents {
    pub invocation_spec: InvocationSpec,
}

impl BusMessage for RequestAgents {
    const TYPE_TAG: &'static str = "RequestAgents";
}

/// Agent → server: this agent is idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReady {
    pub agent_id: String,
}

impl BusMessage for AgentReady {
    const TYPE_TAG: &'static str = "AgentReady";
}

/// Server → agent: run this batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAgentTests {
    pub request_id: String,
    pub invocation_spec: InvocationSpec,
    pub tests_to_run: Vec<TestSpec>,
}

impl BusMessage for RunAgentTests {
    const TYPE_TAG: &'static str = "RunAgentTests";
}

/// Server → agent: stop the batch with this request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelAgentTests {
    pub request_id: String,
}

impl BusMessage for CancelAgentTests {
    const TYPE_TAG: &'static str = "CancelAgentTests";
}

/// Agent → server: a batch finished. `error` replaces per-test results when the whole batch failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTestsComplete {
    pub invocation_id: String,
    pub request_id: String,
    #[serde(default)]
    pub test_results: Vec<TestExecutionInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BusMessage for AgentTestsComplete {
    const TYPE_TAG: &'static str = "AgentTestsComplete";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusUpdateType {
    Started,
    Progress,
    Finished,
    Failed,
}

/// Agent → invoker and server: progress on an individual test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTestStatusUpdate {
    pub invocation_id: String,
    pub agent_run_request_id: String,
    pub test: TestSpec,
    pub update_type: StatusUpdateType,
    #[serde(default)]
    pub message_text: Option<String>,
}

impl BusMessage for AgentTestStatusUpdate {
    const TYPE_TAG: &'static str = "AgentTestStatusUpdate";
}

/// Server → invoker: human readable progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestsProgress {
    pub message: String,
    pub completed_tests_count: usize,
}

impl BusMessage for TestsProgress {
    const TYPE_TAG: &'static str = "TestsProgress";
}

/// Server → invoker: the invocation finished, or could not start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestsComplete {
    #[serde(default)]
    pub results: Option<TestInvocationExecutionInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BusMessage for TestsComplete {
    const TYPE_TAG: &'static str = "TestsComplete";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokerHeartbeat {
    pub invocation_id: String,
}

impl BusMessage for InvokerHeartbeat {
    const TYPE_TAG: &'static str = "InvokerHeartbeat";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTestRunHeartbeat {
    pub request_id: String,
}

impl BusMessage for AgentTestRunHeartbeat {
    const TYPE_TAG: &'static str = "AgentTestRunHeartbeat";
}

/// Broadcast by a host that is shutting down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDisconnected {
    pub host_id: String,
}

impl BusMessage for HostDisconnected {
    const TYPE_TAG: &'static str = "HostDisconnected";
}

/// Broadcast by the server host once it is on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRegistered {
    pub server_id: String,
}

impl BusMessage for ServerRegistered {
    const TYPE_TAG: &'static str = "ServerRegistered";
}

/// Receiver → server: please relay `source_path` on `sender_id` to me.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFileTransfer {
    pub sender_id: String,
    pub receiver_id: String,
    pub stream_id: Uuid,
    pub source_path: String,
}

impl BusMessage for HostFileTransfer {
    const TYPE_TAG: &'static str = "HostFileTransfer";
}

/// Server → source host: upload `requested_path` to the relay stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFileTransferWrite {
    pub stream_id: Uuid,
    pub requested_path: String,
}

impl BusMessage for StartFileTransferWrite {
    const TYPE_TAG: &'static str = "StartFileTransferWrite";
}

/// Server → receiving host: download from the relay stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartFileTransferRead {
    pub stream_id: Uuid,
}

impl BusMessage for StartFileTransferRead {
    const TYPE_TAG: &'static str = "StartFileTransferRead";
}
