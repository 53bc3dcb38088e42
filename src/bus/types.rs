use anyhow::Result;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A message type that can travel over the bus.
///
/// `TYPE_TAG` is the stable wire name of the type; it selects both the
/// deserialization target and the handler set on the receiving host.
pub trait BusMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE_TAG: &'static str;
}

/// Addressed message as it travels between hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender_id: String,
    /// Empty for a broadcast.
    pub recipient_id: String,
    pub type_tag: String,
    pub payload: serde_json::Value,
}

impl MessageEnvelope {
    pub fn new<M: BusMessage>(sender_id: &str, recipient_id: &str, message: &M) -> Result<Self> {
        Ok(Self {
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            type_tag: M::TYPE_TAG.to_string(),
            payload: serde_json::to_value(message)?,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_empty()
    }

    /// True if a host with this id should accept the envelope.
    pub fn is_for(&self, host_id: &str) -> bool {
        self.is_broadcast() || self.recipient_id == host_id
    }
}

/// Transport state of a bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered but never reached the server yet.
    Connecting,
    Ready,
    /// Connection lost; the client is probing the server.
    Idle,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected,
    Reconnected,
}
