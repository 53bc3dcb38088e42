//! Message Bus Server
//!
//! Central relay. Every registered host owns one unbounded delivery queue; the
//! host's long-lived receive stream drains it. Sending enqueues onto one queue
//! (direct) or onto every queue except the sender's (broadcast).
//!
//! ## Responsibilities
//! - **Registration**: Creates a host's queue on demand.
//! - **Fan-out**: Per-recipient ordering is preserved by the single queue per host.
//! - **Teardown**: A queue is removed when its stream ends; `stop` closes them all.

use super::handlers::*;
use super::protocol::*;
use super::types::MessageEnvelope;

use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    routing::{get, post},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct HostQueue {
    generation: u64,
    tx: UnboundedSender<MessageEnvelope>,
    rx: Mutex<Option<UnboundedReceiver<MessageEnvelope>>>,
}

impl HostQueue {
    fn new(generation: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            generation,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

/// Receiving end of a host's queue, handed to the streaming call.
pub struct HostReceiver {
    pub host_id: String,
    pub generation: u64,
    pub rx: UnboundedReceiver<MessageEnvelope>,
}

pub struct BusServer {
    queues: DashMap<String, HostQueue>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl BusServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Binds `bind_addr` and serves the bus endpoints plus any `extra_routes`
    /// until [`BusServer::stop`] is called. Returns the bound address.
    pub async fn init(
        self: &Arc<Self>,
        bind_addr: SocketAddr,
        extra_routes: Router,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let app = Router::new()
            .route(ENDPOINT_PING, post(handle_ping))
            .route(ENDPOINT_REGISTER, post(handle_register))
            .route(&format!("{}/:host_id", ENDPOINT_RECEIVE), get(handle_receive))
            .route(ENDPOINT_SEND, post(handle_send))
            .layer(Extension(self.clone()))
            .merge(extra_routes);

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind bus server to {}", bind_addr))?;
        let local_addr = listener.local_addr()?;

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("Bus server terminated: {}", e);
            }
        });

        tracing::info!("Message bus server listening on {}", local_addr);

        Ok((local_addr, handle))
    }

    /// Creates the host's delivery queue if it does not exist yet.
    pub fn register(&self, host_id: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        self.queues.entry(host_id.to_string()).or_insert_with(|| {
            tracing::info!("Registered host {}", host_id);
            HostQueue::new(self.next_generation.fetch_add(1, Ordering::SeqCst))
        });
    }

    /// Hands out the receiving end of the host's queue.
    ///
    /// If the queue is missing, or another stream already owns its receiver, a
    /// fresh queue replaces it; the previous stream then ends because its sender
    /// is dropped.
    pub fn take_receiver(&self, host_id: &str) -> Option<HostReceiver> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let mut entry = self
            .queues
            .entry(host_id.to_string())
            .or_insert_with(|| HostQueue::new(self.next_generation.fetch_add(1, Ordering::SeqCst)));

        let taken = entry.rx.lock().take();
        let rx = match taken {
            Some(rx) => rx,
            None => {
                tracing::debug!("Host {} opened a second stream, replacing its queue", host_id);
                let mut fresh =
                    HostQueue::new(self.next_generation.fetch_add(1, Ordering::SeqCst));
                let rx = fresh.rx.get_mut().take()?;
                *entry = fresh;
                rx
            }
        };

        Some(HostReceiver {
            host_id: host_id.to_string(),
            generation: entry.generation,
            rx,
        })
    }

    /// Drops the host's queue if it still belongs to the stream that is closing.
    pub fn release(&self, host_id: &str, generation: u64) {
        let removed = self
            .queues
            .remove_if(host_id, |_, queue| queue.generation == generation);
        if removed.is_some() {
            tracing::info!("Host {} stream closed, queue removed", host_id);
        }
    }

    /// Routes an envelope: blank recipient fans out to every other host,
    /// otherwise it goes to the named host or is silently discarded.
    pub fn send_message(&self, envelope: MessageEnvelope) {
        if envelope.is_broadcast() {
            let mut delivered = 0;
            for queue in self.queues.iter() {
                if queue.key() == &envelope.sender_id {
                    continue;
                }
                if queue.tx.send(envelope.clone()).is_ok() {
                    delivered += 1;
                }
            }
            tracing::debug!(
                "Broadcast {} from {} to {} host(s)",
                envelope.type_tag,
                envelope.sender_id,
                delivered
            );
        } else if let Some(queue) = self.queues.get(&envelope.recipient_id) {
            tracing::debug!(
                "Routing {} from {} to {}",
                envelope.type_tag,
                envelope.sender_id,
                envelope.recipient_id
            );
            let _ = queue.tx.send(envelope);
        } else {
            tracing::debug!(
                "Recipient {} for {} is not registered, discarding",
                envelope.recipient_id,
                envelope.type_tag
            );
        }
    }

    pub fn is_registered(&self, host_id: &str) -> bool {
        self.queues.contains_key(host_id)
    }

    pub fn host_count(&self) -> usize {
        self.queues.len()
    }

    /// Closes every queue, ending all in-flight streams, and stops the listener.
    pub fn stop(&self) {
        tracing::info!("Stopping message bus server ({} hosts)", self.queues.len());
        self.shutdown.cancel();
        self.queues.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
