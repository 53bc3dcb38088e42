//! Message Bus Module
//!
//! Addressed publish/subscribe between hosts (server, agents, invoker) over HTTP.
//!
//! ## Architecture Overview
//! 1. **Server**: A central relay holding one delivery queue per registered host.
//! 2. **Client**: Each host registers an id, sends unary `send` calls and drains
//!    its queue through a long-lived Server-Sent Events stream.
//! 3. **Dispatch**: Envelopes carry a type tag; the receiving client decodes the
//!    payload once and runs every handler registered for that tag concurrently.
//!
//! Delivery is best-effort: a message sent while the transport is down is dropped
//! with a log line, never queued or retried.
//!
//! ## Submodules
//! - **`types`**: Envelope, `BusMessage` trait and connection state.
//! - **`protocol`**: Endpoint paths and unary request bodies.
//! - **`registry`**: Tag → decoder + handler list, revocable subscriptions.
//! - **`client`**: HTTP client with connection watcher and receive pump.
//! - **`server`**: Per-host delivery queues and routing.
//! - **`handlers`**: axum handlers for the bus endpoints.
//! - **`heartbeat`**: Cancellable periodic liveness sender.

pub mod client;
pub mod handlers;
pub mod heartbeat;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;


use registry::{MessageRegistry, Subscription};
use types::{BusMessage, ConnectionEvent};

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use tokio::sync::broadcast;

/// A host's view of the bus. Object safe; typed helpers live on [`MessageBusExt`].
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Address this host registered under (empty before `register`).
    fn host_id(&self) -> String;

    /// True iff the transport is currently ready.
    fn is_connected(&self) -> bool;

    fn registry(&self) -> &MessageRegistry;

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Binds this handle to `host_id` and starts watching the connection.
    async fn register(&self, host_id: &str) -> Result<()>;

    /// Fire-and-forget send. A blank `recipient_id` broadcasts to every other host.
    async fn send_raw(&self, recipient_id: &str, type_tag: &str, payload: serde_json::Value);

    /// Announces the departure and stops the background tasks.
    async fn shutdown(&self);
}

#[async_trait]
pub trait MessageBusExt {
    async fn send<M: BusMessage>(&self, recipient_id: &str, message: &M);

    async fn broadcast<M: BusMessage>(&self, message: &M);

    fn on_message<M, F, Fut>(&self, handler: F) -> Subscription
    where
        M: BusMessage,
        F: Fn(String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static;
}

#[async_trait]
impl<B: MessageBus + ?Sized> MessageBusExt for B {
    async fn send<M: BusMessage>(&self, recipient_id: &str, message: &M) {
        match serde_json::to_value(message) {
            Ok(payload) => self.send_raw(recipient_id, M::TYPE_TAG, payload).await,
            Err(e) => tracing::error!("Failed to serialize {}: {}", M::TYPE_TAG, e),
        }
    }

    async fn broadcast<M: BusMessage>(&self, message: &M) {
        self.send("", message).await
    }

    fn on_message<M, F, Fut>(&self, handler: F) -> Subscription
    where
        M: BusMessage,
        F: Fn(String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry().register(handler)
    }
}
