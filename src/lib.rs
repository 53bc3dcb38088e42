//! Distributed Test Runner Library
//!
//! This library crate defines the modules that make up the test runner. It serves as
//! the foundation for the binary executable (`main.rs`), which runs one of three roles:
//! server, agent or invoker.
//!
//! ## Architecture Modules
//! - **`bus`**: Addressed message bus over HTTP. A bus server hosts one queue per host;
//!   clients register, stream their queue, and dispatch typed messages to handlers.
//! - **`model`**: Test, invocation and result types plus every bus message.
//! - **`server`**: The scheduler. Accepts invocations, hands batches to idle agents,
//!   retries failures, watches health and reports aggregate results.
//! - **`agent`**: Worker slots that execute one batch at a time and report back.
//! - **`invoker`**: Requests an invocation, serves the build output and writes results.
//! - **`workspace`**: Local working folders and the relayed file transfer that fills them.
//! - **`runner`**: Test enumeration and execution behind traits; `libtest` drives Rust
//!   test binaries.
//! - **`stats`**: Persisted per-test durations and invocation history, used to order work.
//! - **`config`**: Configuration structs for each role.

pub mod agent;
pub mod bus;
pub mod config;
pub mod invoker;
pub mod model;
pub mod runner;
pub mod server;
pub mod stats;
pub mod workspace;

use anyhow::{Context, Result};

/// Installs the global tracing subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;

    Ok(())
}
