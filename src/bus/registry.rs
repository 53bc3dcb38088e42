//! Message Handler Registry
//!
//! Maps a message type tag to a decoder plus the list of handlers interested in it.
//! The payload is decoded once per envelope and every live handler gets its own copy,
//! each running as an independent tokio task so a slow or failing handler never
//! blocks the receive pump or its siblings.

use super::types::*;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;

type DecodedMessage = Arc<dyn Any + Send + Sync>;

type DecodeFn = Arc<dyn Fn(serde_json::Value) -> Result<DecodedMessage> + Send + Sync>;

/// Type-erased handler: receives the sender id and the decoded message.
pub type MessageHandlerFn = Arc<
    dyn Fn(String, DecodedMessage) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

struct Registration {
    handler: Mutex<Option<MessageHandlerFn>>,
}

struct TypeEntry {
    decode: DecodeFn,
    registrations: Vec<Arc<Registration>>,
}

/// Revocable handle returned by [`MessageRegistry::register`].
///
/// Dropping the handle leaves the handler registered; call [`Subscription::revoke`]
/// to stop it. A dispatch already in flight may still complete once after revoking.
#[derive(Clone)]
pub struct Subscription {
    registration: Arc<Registration>,
}

impl Subscription {
    pub fn revoke(&self) {
        self.registration.handler.lock().take();
    }

    pub fn is_active(&self) -> bool {
        self.registration.handler.lock().is_some()
    }
}

#[derive(Default)]
pub struct MessageRegistry {
    types: DashMap<String, TypeEntry>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for messages of type `M`.
    pub fn register<M, F, Fut>(&self, handler: F) -> Subscription
    where
        M: BusMessage,
        F: Fn(String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler_fn: MessageHandlerFn = Arc::new(move |sender_id: String, decoded| {
            match decoded.downcast_ref::<M>() {
                Some(message) => Box::pin(handler(sender_id, message.clone()))
                    as Pin<Box<dyn Future<Output = Result<()>> + Send>>,
                None => Box::pin(async move {
                    Err(anyhow::anyhow!("Decoded payload is not a {}", M::TYPE_TAG))
                }),
            }
        });

        let registration = Arc::new(Registration {
            handler: Mutex::new(Some(handler_fn)),
        });

        let mut entry = self
            .types
            .entry(M::TYPE_TAG.to_string())
            .or_insert_with(|| TypeEntry {
                decode: Arc::new(|payload| {
                    let message: M = serde_json::from_value(payload)?;
                    Ok(Arc::new(message) as DecodedMessage)
                }),
                registrations: Vec::new(),
            });

        // Revoked handlers are pruned lazily here rather than on revoke.
        entry
            .registrations
            .retain(|r| r.handler.lock().is_some());
        entry.registrations.push(registration.clone());

        tracing::debug!("Registered handler for message type {}", M::TYPE_TAG);

        Subscription { registration }
    }

    /// Decodes the envelope and spawns every live handler for its type.
    ///
    /// Unknown type tags are dropped. Returns the handles of the spawned handler tasks.
    pub fn dispatch(&self, envelope: MessageEnvelope) -> Vec<JoinHandle<()>> {
        let (decode, handlers) = match self.types.get(&envelope.type_tag) {
            Some(entry) => {
                let handlers: Vec<MessageHandlerFn> = entry
                    .registrations
                    .iter()
                    .filter_map(|r| r.handler.lock().clone())
                    .collect();
                (entry.decode.clone(), handlers)
            }
            None => {
                tracing::debug!(
                    "No handlers for message type {} from {}, dropping",
                    envelope.type_tag,
                    envelope.sender_id
                );
                return Vec::new();
            }
        };

        if handlers.is_empty() {
            return Vec::new();
        }

        let decoded = match decode(envelope.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    "Failed to decode {} from {}: {}",
                    envelope.type_tag,
                    envelope.sender_id,
                    e
                );
                return Vec::new();
            }
        };

        handlers
            .into_iter()
            .map(|handler| {
                let sender_id = envelope.sender_id.clone();
                let type_tag = envelope.type_tag.clone();
                let decoded = decoded.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler(sender_id.clone(), decoded).await {
                        tracing::error!(
                            "Handler for {} from {} failed: {:#}",
                            type_tag,
                            sender_id,
                            e
                        );
                    }
                })
            })
            .collect()
    }

    pub fn handler_count(&self, type_tag: &str) -> usize {
        self.types
            .get(type_tag)
            .map(|entry| {
                entry
                    .registrations
                    .iter()
                    .filter(|r| r.handler.lock().is_some())
                    .count()
            })
            .unwrap_or(0)
    }
}
