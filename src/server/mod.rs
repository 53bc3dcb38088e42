//! Test Server
//!
//! The coordinating host. It owns all in-flight scheduling state; agents and
//! invokers only see it through bus messages.
//!
//! ## Architecture Overview
//! - **`state`**: Per-invocation maps, the LIFO test pool and exactly-once completion.
//! - **`retriever`**: Fetches the invoker's build output and enumerates tests, slowest last.
//! - **`starter`**: Handles `InvokeTests` and `AgentReady`.
//! - **`complete`**: Handles `AgentTestsComplete` and the retry-or-finalize decision.
//! - **`monitor`**: Heartbeat/inactivity sweep, `HostDisconnected` handling.
//! - **`transfer`**: HTTP relay pairing file uploads with downloads.
//! - **`host`**: Wires the above to a bus server and the server's own bus client.

pub mod complete;
pub mod host;
pub mod monitor;
pub mod retriever;
pub mod starter;
pub mod state;
pub mod transfer;
pub mod types;
