//! Shared Data Model
//!
//! Types exchanged between the invoker, the server and the agents.
//!
//! ## Submodules
//! - **`types`**: Test identities, per-test execution records and invocation specs.
//! - **`messages`**: The wire message set carried over the bus, one struct per message type.

pub mod messages;
pub mod types;
