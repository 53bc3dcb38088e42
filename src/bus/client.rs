//! HTTP Message Bus Client
//!
//! Per-host handle onto the bus. Outbound messages are unary POSTs; inbound
//! messages arrive on a Server-Sent Events stream drained by a receive pump.
//!
//! ## Responsibilities
//! - **Connection watching**: A background task reacts to every state change:
//!   `Ready` re-registers and opens the stream, `Idle` reports the disconnect
//!   and pings the server with backoff, `Shutdown` ends the watcher.
//! - **Dispatch**: Accepted envelopes go to the [`MessageRegistry`], which runs
//!   each handler as its own task.
//! - **Best-effort sending**: Sends while not `Ready` are dropped with a warning.

use super::MessageBus;
use super::protocol::*;
use super::registry::MessageRegistry;
use super::types::*;
use crate::config::ServerConnectionConfig;
use crate::model::messages::HostDisconnected;

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const UNARY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpBusClient {
    config: ServerConnectionConfig,
    host_id: RwLock<String>,
    http_client: reqwest::Client,
    registry: MessageRegistry,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
    /// Set when `Ready` came from the ping inside `register`; that transition is not a reconnect.
    initial_ready: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Flips to true once the first receive stream is open.
    stream_opened: watch::Sender<bool>,
    this: Weak<HttpBusClient>,
}

impl HttpBusClient {
    pub fn new(config: ServerConnectionConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(16);
        let (stream_opened, _) = watch::channel(false);

        Arc::new_cyclic(|this| Self {
            config,
            host_id: RwLock::new(String::new()),
            http_client: reqwest::Client::new(),
            registry: MessageRegistry::new(),
            state_tx,
            events,
            shutdown: CancellationToken::new(),
            initial_ready: AtomicBool::new(false),
            watcher: Mutex::new(None),
            pump: Mutex::new(None),
            stream_opened,
            this: this.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Moves `Ready` to `Idle`. Any other state is left alone.
    fn mark_idle(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Ready {
                *state = ConnectionState::Idle;
                true
            } else {
                false
            }
        });
    }

    fn set_ready(&self) -> bool {
        self.state_tx.send_if_modified(|state| {
            if matches!(*state, ConnectionState::Connecting | ConnectionState::Idle) {
                *state = ConnectionState::Ready;
                true
            } else {
                false
            }
        })
    }

    async fn ping(&self) -> Result<()> {
        let response = self
            .http_client
            .post(self.config.url(ENDPOINT_PING))
            .json(&Ack::default())
            .timeout(UNARY_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Ping failed: {}", response.status()));
        }
        Ok(())
    }

    /// Pings the server with exponential backoff and jitter until it answers
    /// or the client shuts down.
    async fn ping_until_ready(&self) {
        let mut delay_ms = self.config.reconnect_backoff_min.as_millis() as u64;
        let max_ms = self.config.reconnect_backoff_max.as_millis() as u64;

        loop {
            let jitter = rand::random::<u64>() % 50;
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms + jitter)) => {}
            }

            match self.ping().await {
                Ok(()) => {
                    tracing::info!("Bus server at {} is reachable", self.config.server_url);
                    self.set_ready();
                    return;
                }
                Err(e) => {
                    tracing::debug!("Bus server ping failed: {}", e);
                    delay_ms = (delay_ms * 2).min(max_ms.max(1));
                }
            }
        }
    }

    async fn watch_connection(self: Arc<Self>) {
        let mut state_rx = self.state_tx.subscribe();

        loop {
            let state = *state_rx.borrow_and_update();
            tracing::debug!("Bus client {} state: {:?}", self.host_id(), state);

            match state {
                ConnectionState::Ready => match self.start_pump().await {
                    Ok(()) => {
                        if !self.initial_ready.swap(false, Ordering::SeqCst) {
                            tracing::info!("Bus client {} reconnected", self.host_id());
                            let _ = self.events.send(ConnectionEvent::Reconnected);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to open receive stream: {:#}", e);
                        self.initial_ready.store(false, Ordering::SeqCst);
                        self.mark_idle();
                    }
                },
                ConnectionState::Idle => {
                    tracing::warn!("Bus client {} lost its connection", self.host_id());
                    let _ = self.events.send(ConnectionEvent::Disconnected);
                    self.ping_until_ready().await;
                }
                ConnectionState::Connecting => {
                    self.ping_until_ready().await;
                }
                ConnectionState::Shutdown => break,
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            // A state change made while we were busy is already marked as seen-or-not;
            // `changed` returns immediately in that case.
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::debug!("Bus client {} watcher stopped", self.host_id());
    }

    /// Registers with the server and starts draining the receive stream.
    async fn start_pump(&self) -> Result<()> {
        let host_id = self.host_id();

        let response = self
            .http_client
            .post(self.config.url(ENDPOINT_REGISTER))
            .json(&RegisterRequest {
                host_id: host_id.clone(),
            })
            .timeout(UNARY_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Register failed: {}", response.status()));
        }

        let response = self
            .http_client
            .get(self.config.url(&format!("{}/{}", ENDPOINT_RECEIVE, host_id)))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Receive stream refused: {}",
                response.status()
            ));
        }

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Bus client dropped"))?;

        let handle = tokio::spawn(async move {
            this.receive_loop(response).await;
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
        self.stream_opened.send_replace(true);

        Ok(())
    }

    pub(super) async fn receive_loop(self: Arc<Self>, response: reqwest::Response) {
        let host_id = self.host_id();
        let idle_timeout = self.config.stream_idle_timeout;
        let mut bytes_stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        loop {
            let chunk = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                chunk = tokio::time::timeout(idle_timeout, bytes_stream.next()) => chunk,
            };

            let chunk = match chunk {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => {
                    tracing::debug!("Receive stream error for {}: {}", host_id, e);
                    break;
                }
                Ok(None) => {
                    tracing::debug!("Receive stream for {} closed by server", host_id);
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        "Receive stream for {} silent for {:?}, assuming it is dead",
                        host_id,
                        idle_timeout
                    );
                    break;
                }
            };

            for frame in decoder.push(&chunk) {
                self.handle_frame(&host_id, &frame);
            }
        }

        if !self.shutdown.is_cancelled() {
            self.mark_idle();
        }
    }

    fn handle_frame(&self, host_id: &str, data: &str) {
        let envelope: MessageEnvelope = match serde_json::from_str(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Malformed envelope on {}'s stream: {}", host_id, e);
                return;
            }
        };

        if !envelope.is_for(host_id) {
            tracing::debug!(
                "Ignoring {} addressed to {}",
                envelope.type_tag,
                envelope.recipient_id
            );
            return;
        }

        self.registry.dispatch(envelope);
    }
}

#[async_trait]
impl MessageBus for HttpBusClient {
    fn host_id(&self) -> String {
        self.host_id.read().clone()
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn register(&self, host_id: &str) -> Result<()> {
        *self.host_id.write() = host_id.to_string();

        let reachable = match self.ping().await {
            Ok(()) => {
                self.initial_ready.store(true, Ordering::SeqCst);
                self.set_ready();
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Bus server at {} not reachable yet ({}), will keep trying",
                    self.config.server_url,
                    e
                );
                false
            }
        };

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("Bus client dropped"))?;
        let handle = tokio::spawn(this.watch_connection());
        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }

        // Messages addressed to us are dropped until the server holds our queue.
        if reachable {
            let mut opened = self.stream_opened.subscribe();
            let open_in_time = matches!(
                tokio::time::timeout(UNARY_TIMEOUT, opened.wait_for(|open| *open)).await,
                Ok(Ok(_))
            );
            if !open_in_time {
                tracing::warn!("Receive stream for {} is not open yet", host_id);
            }
        }

        tracing::info!("Registered {} on the message bus", host_id);
        Ok(())
    }

    async fn send_raw(&self, recipient_id: &str, type_tag: &str, payload: serde_json::Value) {
        if !self.is_connected() {
            tracing::warn!(
                "Message bus not ready, dropping {} for '{}'",
                type_tag,
                recipient_id
            );
            return;
        }

        let envelope = MessageEnvelope {
            sender_id: self.host_id(),
            recipient_id: recipient_id.to_string(),
            type_tag: type_tag.to_string(),
            payload,
        };

        let response = self
            .http_client
            .post(self.config.url(ENDPOINT_SEND))
            .json(&envelope)
            .timeout(UNARY_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                tracing::warn!("Sending {} was rejected: {}", type_tag, resp.status());
            }
            Err(e) => {
                tracing::warn!("Sending {} failed: {}", type_tag, e);
                if e.is_connect() || e.is_timeout() {
                    self.mark_idle();
                }
            }
        }
    }

    async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let host_id = self.host_id();
        if self.is_connected() && !host_id.is_empty() {
            if let Ok(payload) = serde_json::to_value(HostDisconnected {
                host_id: host_id.clone(),
            }) {
                self.send_raw("", <HostDisconnected as BusMessage>::TYPE_TAG, payload)
                    .await;
            }
        }

        self.state_tx.send_replace(ConnectionState::Shutdown);
        self.shutdown.cancel();

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        tracing::info!("Bus client {} shut down", host_id);
    }
}

/// Splits a Server-Sent Events byte stream into `data` payloads.
///
/// Bytes are buffered until a whole line has arrived, so a code point split
/// across two network chunks decodes intact.
#[derive(Debug, Default)]
pub(super) struct SseDecoder {
    buffer: BytesMut,
    data: String,
}

impl SseDecoder {
    /// Feeds one chunk and returns every event completed by it.
    pub(super) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(newline_pos + 1);
            let line = match std::str::from_utf8(&raw[..newline_pos]) {
                Ok(line) => line.trim_end_matches('\r'),
                Err(e) => {
                    tracing::warn!("Receive stream sent an invalid UTF-8 line: {}", e);
                    continue;
                }
            };

            // Keep-alive comment.
            if line.starts_with(':') {
                continue;
            }

            if line.is_empty() {
                if !self.data.is_empty() {
                    frames.push(std::mem::take(&mut self.data));
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.strip_prefix(' ').unwrap_or(data));
            }
        }

        frames
    }
}
