//! Workspace Tests
//!
//! ## Test Scopes
//! - **Allocation**: Folder reuse per host/run pair, numbering and failure cleanup.
//! - **Transfer**: A folder copied between two bus clients through the server relay.

use super::handler::WorkspaceHandler;
use super::transfer::HttpFileTransfer;
use super::{FileTransfer, LocalWorkspace};
use crate::bus::MessageBus;
use crate::bus::client::HttpBusClient;
use crate::bus::server::BusServer;
use crate::config::{ServerConnectionConfig, WorkspaceConfig};
use crate::model::tests::sample_invocation;
use crate::model::types::RemotePathInfo;
use crate::server::transfer::FileTransferRelay;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

/// Writes one file per copy; fails the first `fail_first` copies.
#[derive(Default)]
struct CountingTransfer {
    copies: AtomicUsize,
    fail_first: usize,
}

#[async_trait]
impl FileTransfer for CountingTransfer {
    async fn copy_remote_files(&self, source: &RemotePathInfo, local_dest: &Path) -> Result<()> {
        let n = self.copies.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(local_dest.join("partial.bin"), b"half").await?;
        if n < self.fail_first {
            return Err(anyhow!("connection to {} dropped", source.host_id));
        }
        tokio::fs::write(local_dest.join("suite"), source.source_path.as_bytes()).await?;
        Ok(())
    }
}

fn handler(dir: &TempDir, transfer: Arc<CountingTransfer>) -> Arc<WorkspaceHandler> {
    WorkspaceHandler::new(
        WorkspaceConfig {
            working_folder: dir.path().to_path_buf(),
            ..WorkspaceConfig::default()
        },
        transfer,
    )
}

// ============================================================
// TEST 1: Allocation
// ============================================================

#[tokio::test]
async fn test_workspace_is_reused_for_same_run() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    let transfer = Arc::new(CountingTransfer::default());
    let handler = handler(&dir, transfer.clone());
    let spec = sample_invocation("inv-1");

    // ACT
    let first = handler.create_local_workspace(&spec).await.unwrap();
    let second = handler.create_local_workspace(&spec).await.unwrap();

    // ASSERT
    assert_eq!(first.base_path, second.base_path);
    assert_eq!(first.base_path, dir.path().join("1"));
    assert_eq!(transfer.copies.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.test_binary(),
        dir.path().join("1").join("deps/suite")
    );
    assert!(dir.path().join("Host_Invoker_inv-1_inv-1.txt").exists());
}

#[tokio::test]
async fn test_each_run_gets_its_own_numbered_folder() {
    let dir = TempDir::new().unwrap();
    let transfer = Arc::new(CountingTransfer::default());
    let handler = handler(&dir, transfer.clone());

    let a = handler
        .create_local_workspace(&sample_invocation("inv-1"))
        .await
        .unwrap();
    let b = handler
        .create_local_workspace(&sample_invocation("inv-2"))
        .await
        .unwrap();

    assert_eq!(a.base_path, dir.path().join("1"));
    assert_eq!(b.base_path, dir.path().join("2"));
    assert_eq!(transfer.copies.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_copy_leaves_nothing_behind() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    let transfer = Arc::new(CountingTransfer {
        fail_first: 1,
        ..CountingTransfer::default()
    });
    let handler = handler(&dir, transfer.clone());
    let spec = sample_invocation("inv-1");

    // ACT
    let err = handler.create_local_workspace(&spec).await.unwrap_err();

    // ASSERT
    assert!(err.to_string().contains("connection to Invoker_inv-1 dropped"));
    assert!(!dir.path().join("1").exists());
    assert!(!dir.path().join("Host_Invoker_inv-1_inv-1.txt").exists());

    let retried = handler.create_local_workspace(&spec).await.unwrap();
    assert_eq!(retried.base_path, dir.path().join("1"));
    assert!(retried.base_path.join("suite").exists());
    assert_eq!(transfer.copies.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_after_failed_copy_never_takes_another_runs_folder() {
    // ARRANGE
    let dir = TempDir::new().unwrap();
    let transfer = Arc::new(CountingTransfer {
        fail_first: 1,
        ..CountingTransfer::default()
    });
    let handler = handler(&dir, transfer.clone());
    let first = sample_invocation("inv-1");
    let mut second = sample_invocation("inv-2");
    second.source_path.source_path = "/tmp/other-build".to_string();

    // ACT: inv-1 fails, inv-2 takes the freed number, inv-1 retries
    handler.create_local_workspace(&first).await.unwrap_err();
    let b = handler.create_local_workspace(&second).await.unwrap();
    let a = handler.create_local_workspace(&first).await.unwrap();

    // ASSERT
    assert_eq!(b.base_path, dir.path().join("1"));
    assert_eq!(a.base_path, dir.path().join("2"));
    assert_eq!(transfer.copies.load(Ordering::SeqCst), 3);
    assert_eq!(
        std::fs::read_to_string(a.base_path.join("suite")).unwrap(),
        first.source_path.source_path
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_copy_once() {
    let dir = TempDir::new().unwrap();
    let transfer = Arc::new(CountingTransfer::default());
    let handler = handler(&dir, transfer.clone());

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .create_local_workspace(&sample_invocation("inv-1"))
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut paths = Vec::new();
    for task in tasks {
        let workspace: LocalWorkspace = task.await.unwrap();
        paths.push(workspace.base_path);
    }

    paths.dedup();
    assert_eq!(paths.len(), 1);
    assert_eq!(transfer.copies.load(Ordering::SeqCst), 1);
}

// ============================================================
// TEST 2: Relayed transfer
// ============================================================

struct TransferHarness {
    server: Arc<BusServer>,
    clients: Vec<Arc<HttpBusClient>>,
}

impl TransferHarness {
    async fn stop(self) {
        for client in self.clients {
            client.shutdown().await;
        }
        self.server.stop();
    }
}

fn fast_config(addr: SocketAddr) -> ServerConnectionConfig {
    ServerConnectionConfig {
        server_url: format!("http://{}/", addr),
        reconnect_backoff_min: Duration::from_millis(20),
        reconnect_backoff_max: Duration::from_millis(100),
        ..ServerConnectionConfig::default()
    }
}

/// A bus server with the relay, the server's own client and one transfer
/// endpoint per host id in `hosts`.
async fn transfer_harness(
    hosts: &[&str],
    config: &WorkspaceConfig,
) -> (TransferHarness, Vec<Arc<HttpFileTransfer>>) {
    let server = BusServer::new();
    let relay = FileTransferRelay::new(config.transfer_timeout);
    let (addr, _listener) = server
        .init("127.0.0.1:0".parse().unwrap(), relay.routes())
        .await
        .unwrap();
    let connection = fast_config(addr);

    let server_client = HttpBusClient::new(connection.clone());
    let server_bus: Arc<dyn MessageBus> = server_client.clone();
    relay.init(&server_bus);
    server_client.register(&connection.server_id).await.unwrap();

    let mut clients = vec![server_client];
    let mut transfers = Vec::new();
    for host in hosts {
        let client = HttpBusClient::new(connection.clone());
        let bus: Arc<dyn MessageBus> = client.clone();
        let transfer = HttpFileTransfer::new(bus, connection.clone(), config);
        transfer.init();
        client.register(host).await.unwrap();
        clients.push(client);
        transfers.push(transfer);
    }

    for _ in 0..200 {
        let registered = hosts.iter().all(|h| server.is_registered(h))
            && server.is_registered(&connection.server_id);
        if registered {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    (TransferHarness { server, clients }, transfers)
}

#[tokio::test]
async fn test_folder_is_copied_through_the_relay() {
    // ARRANGE
    let source = TempDir::new().unwrap();
    std::fs::create_dir_all(source.path().join("deps")).unwrap();
    std::fs::write(source.path().join("deps/suite"), b"#!/bin/sh\n").unwrap();
    std::fs::write(source.path().join("config.toml"), b"x = 1\n").unwrap();
    let big: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    std::fs::write(source.path().join("deps/data.bin"), &big).unwrap();

    let dest = TempDir::new().unwrap();
    let (harness, transfers) =
        transfer_harness(&["Invoker_x", "Agent_a_0"], &WorkspaceConfig::default()).await;

    // ACT
    tokio::time::timeout(
        Duration::from_secs(20),
        transfers[1].copy_remote_files(
            &RemotePathInfo {
                host_id: "Invoker_x".to_string(),
                source_path: source.path().to_string_lossy().to_string(),
            },
            dest.path(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    // ASSERT
    assert_eq!(
        std::fs::read(dest.path().join("deps/suite")).unwrap(),
        b"#!/bin/sh\n"
    );
    assert_eq!(
        std::fs::read(dest.path().join("config.toml")).unwrap(),
        b"x = 1\n"
    );
    assert_eq!(std::fs::read(dest.path().join("deps/data.bin")).unwrap(), big);

    harness.stop().await;
}

#[tokio::test]
async fn test_copy_from_silent_host_times_out() {
    let config = WorkspaceConfig {
        transfer_timeout: Duration::from_millis(500),
        ..WorkspaceConfig::default()
    };
    let dest = TempDir::new().unwrap();
    let (harness, transfers) = transfer_harness(&["Agent_a_0"], &config).await;

    let err = transfers[0]
        .copy_remote_files(
            &RemotePathInfo {
                host_id: "Invoker_gone".to_string(),
                source_path: "/tmp/build".to_string(),
            },
            dest.path(),
        )
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("Timed out after"), "{}", err);
    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_stream_is_not_found() {
    let server = BusServer::new();
    let relay = FileTransferRelay::new(Duration::from_secs(60));
    let (addr, _listener) = server
        .init("127.0.0.1:0".parse().unwrap(), relay.routes())
        .await
        .unwrap();

    let response = reqwest::get(format!("http://{}/stream/{}", addr, uuid::Uuid::new_v4()))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    server.stop();
}
