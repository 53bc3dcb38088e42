//! Invoker
//!
//! The host a developer or CI job runs: it asks the server to run one test
//! binary, serves the binary's folder to whoever needs it, streams progress
//! into the log and writes the aggregate result.
//!
//! ## Submodules
//! - **`paths`**: Base path / test binary validation.
//! - **`invocation`**: The request-wait-serialize flow and the reconnect timeout.
//! - **`serializer`**: `ResultSerializer` and the JSON implementation.

pub mod invocation;
pub mod paths;
pub mod serializer;
