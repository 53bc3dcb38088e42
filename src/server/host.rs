use super::complete::TestCompleteHandler;
use super::monitor::TestHealthMonitor;
use super::retriever::TestRetriever;
use super::starter::TestStarter;
use super::state::ServerTestState;
use super::transfer::FileTransferRelay;
use crate::bus::client::HttpBusClient;
use crate::bus::server::BusServer;
use crate::bus::{MessageBus, MessageBusExt};
use crate::config::{ServerConfig, ServerConnectionConfig, StorageConfig, WorkspaceConfig};
use crate::model::messages::ServerRegistered;
use crate::runner::TestEnumerator;
use crate::stats::StatsService;
use crate::workspace::handler::WorkspaceHandler;
use crate::workspace::transfer::HttpFileTransfer;

use anyhow::Result;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Everything the server process runs: the bus server, the server's own bus
/// client and the scheduling components wired to it.
pub struct ServerHost {
    bus_server: Arc<BusServer>,
    client: Arc<HttpBusClient>,
    state: Arc<ServerTestState>,
    monitor: Arc<TestHealthMonitor>,
    local_addr: SocketAddr,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHost {
    pub async fn start(
        config: ServerConfig,
        connection: ServerConnectionConfig,
        workspace: WorkspaceConfig,
        storage: StorageConfig,
        enumerator: Arc<dyn TestEnumerator>,
    ) -> Result<Arc<Self>> {
        let bus_server = BusServer::new();
        let relay = FileTransferRelay::new(workspace.transfer_timeout);
        let (local_addr, listener) = bus_server.init(config.bind_addr, relay.routes()).await?;

        let connection = ServerConnectionConfig {
            server_url: loopback_url(local_addr),
            ..connection
        };
        let client = HttpBusClient::new(connection.clone());
        let bus: Arc<dyn MessageBus> = client.clone();

        relay.init(&bus);
        let file_transfer = HttpFileTransfer::new(bus.clone(), connection.clone(), &workspace);
        file_transfer.init();

        let stats = StatsService::new(&storage.state_folder);
        let state = ServerTestState::new(config.batch_size, stats.clone());
        let retriever = TestRetriever::new(
            WorkspaceHandler::new(workspace, file_transfer),
            enumerator,
            stats,
        );

        let complete = TestCompleteHandler::new(bus.clone(), state.clone());
        complete.init();
        let starter = TestStarter::new(bus.clone(), retriever, state.clone(), complete.clone());
        starter.init();
        let monitor = TestHealthMonitor::new(
            bus.clone(),
            state.clone(),
            complete,
            config.health_check_interval,
        );
        monitor.init();

        client.register(&connection.server_id).await?;
        bus.broadcast(&ServerRegistered {
            server_id: connection.server_id.clone(),
        })
        .await;

        tracing::info!("Server {} started on {}", connection.server_id, local_addr);

        Ok(Arc::new(Self {
            bus_server,
            client,
            state,
            monitor,
            local_addr,
            listener: Mutex::new(Some(listener)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_host_registered(&self, host_id: &str) -> bool {
        self.bus_server.is_registered(host_id)
    }

    pub fn state(&self) -> &Arc<ServerTestState> {
        &self.state
    }

    pub async fn stop(&self) {
        self.monitor.stop().await;
        self.client.shutdown().await;
        self.bus_server.stop();

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
        tracing::info!("Server stopped");
    }
}

/// URL a client on this machine uses to reach `addr`.
pub fn loopback_url(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("http://127.0.0.1:{}/", addr.port())
    } else {
        format!("http://{}/", addr)
    }
}
