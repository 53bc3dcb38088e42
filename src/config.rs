//! Host Configuration
//!
//! Plain configuration structs for each host role. The CLI fills these in; everything
//! else receives them by value (or behind an `Arc`) at construction time.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:34872/";
pub const DEFAULT_SERVER_ID: &str = "Server";

/// How a host reaches the message bus server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConnectionConfig {
    /// Base URL of the bus server, e.g. `http://localhost:34872/`.
    pub server_url: String,
    /// Bus address of the server host.
    pub server_id: String,
    /// A receive stream with no bytes (data or keep-alive) for this long is treated as dead.
    pub stream_idle_timeout: Duration,
    pub reconnect_backoff_min: Duration,
    pub reconnect_backoff_max: Duration,
}

impl ServerConnectionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Joins an endpoint path onto the server url without doubling the slash.
    pub fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.server_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

impl Default for ServerConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            server_id: DEFAULT_SERVER_ID.to_string(),
            stream_idle_timeout: Duration::from_secs(45),
            reconnect_backoff_min: Duration::from_millis(150),
            reconnect_backoff_max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound on tests handed to one agent in a single batch.
    pub batch_size: usize,
    pub health_check_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 34872)),
            batch_size: 10,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root under which per-run working folders are allocated.
    pub working_folder: PathBuf,
    /// Upper bound on one remote folder copy.
    pub transfer_timeout: Duration,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            working_folder: PathBuf::from("./testout-work"),
            transfer_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Folder holding `stats.json`.
    pub state_folder: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_folder: PathBuf::from("./testout-state"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    pub test_assembly_path: PathBuf,
    /// Folder shipped to the server. Defaults to the test binary's parent folder.
    pub base_path: Option<PathBuf>,
    pub result_filename: PathBuf,
    pub max_retry_count: u32,
    pub test_inactivity_timeout_seconds: u64,
    /// How long to wait for the bus to come back after a disconnect.
    pub reconnect_timeout: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            test_assembly_path: PathBuf::new(),
            base_path: None,
            result_filename: PathBuf::from("testout-results.json"),
            max_retry_count: 2,
            test_inactivity_timeout_seconds: 1200,
            reconnect_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Friendly agent name; a uuid is used when absent.
    pub name: Option<String>,
    /// Worker count; defaults to the number of CPUs.
    pub max_workers: Option<usize>,
}

impl AgentConfig {
    pub fn effective_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
