//! In-memory bus double for component tests.

use super::MessageBus;
use super::registry::MessageRegistry;
use super::types::*;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub recipient_id: String,
    pub type_tag: String,
    pub payload: serde_json::Value,
}

impl SentMessage {
    pub fn decode<M: BusMessage>(&self) -> Option<M> {
        if self.type_tag != M::TYPE_TAG {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Records every send and lets tests inject inbound messages.
pub struct RecordingBus {
    host_id: Mutex<String>,
    connected: AtomicBool,
    registry: MessageRegistry,
    events: broadcast::Sender<ConnectionEvent>,
    sent: Mutex<Vec<SentMessage>>,
}

impl RecordingBus {
    pub fn new(host_id: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            host_id: Mutex::new(host_id.to_string()),
            connected: AtomicBool::new(true),
            registry: MessageRegistry::new(),
            events,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// All recorded messages of type `M`, with their recipients.
    pub fn sent_of<M: BusMessage>(&self) -> Vec<(String, M)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| m.decode::<M>().map(|d| (m.recipient_id.clone(), d)))
            .collect()
    }

    /// Delivers `message` as if it arrived from `sender_id` and waits for every handler.
    pub async fn deliver<M: BusMessage>(&self, sender_id: &str, message: &M) {
        let host_id = self.host_id.lock().clone();
        let envelope = match MessageEnvelope::new(sender_id, &host_id, message) {
            Ok(envelope) => envelope,
            Err(e) => panic!("failed to build envelope: {e}"),
        };
        for handle in self.registry.dispatch(envelope) {
            handle.await.unwrap();
        }
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    fn host_id(&self) -> String {
        self.host_id.lock().clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn register(&self, host_id: &str) -> Result<()> {
        *self.host_id.lock() = host_id.to_string();
        Ok(())
    }

    async fn send_raw(&self, recipient_id: &str, type_tag: &str, payload: serde_json::Value) {
        if !self.is_connected() {
            return;
        }
        self.sent.lock().push(SentMessage {
            recipient_id: recipient_id.to_string(),
            type_tag: type_tag.to_string(),
            payload,
        });
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
