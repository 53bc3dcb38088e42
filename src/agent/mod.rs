//! Agent
//!
//! Worker side of the runner. An agent process hosts several workers; each one
//! is its own host on the bus and runs at most one batch at a time.
//!
//! ## Submodules
//! - **`worker`**: One batch at a time: workspace, runner, heartbeat, report, ready.
//! - **`progress`**: Per-test status updates to the invoker and the server.
//! - **`host`**: Starts and stops the workers of one process.

pub mod host;
pub mod progress;
pub mod worker;

#[cfg(test)]
mod tests;
