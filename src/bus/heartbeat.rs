//! Heartbeat Sender
//!
//! Sends a liveness message to the server on a fixed interval while some long
//! operation (a test batch, an invocation) is running.

use super::types::BusMessage;
use super::{MessageBus, MessageBusExt};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HeartbeatSender {
    bus: Arc<dyn MessageBus>,
    server_id: String,
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(bus: Arc<dyn MessageBus>, server_id: impl Into<String>) -> Self {
        Self {
            bus,
            server_id: server_id.into(),
            interval: HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Starts sending `message` to the server every interval until stopped.
    /// The first beat goes out one interval after the start.
    pub fn start<M: BusMessage>(&self, message: M) -> RunningHeartbeat {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let bus = self.bus.clone();
        let server_id = self.server_id.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if loop_token.is_cancelled() {
                    break;
                }

                if bus.is_connected() {
                    tracing::trace!("Sending {} heartbeat", M::TYPE_TAG);
                    bus.send(&server_id, &message).await;
                }
            }
        });

        RunningHeartbeat {
            token,
            handle: Mutex::new(Some(handle)),
        }
    }
}

/// Handle to a running heartbeat. Dropping it cancels the loop without waiting.
pub struct RunningHeartbeat {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RunningHeartbeat {
    /// Cancels the loop and waits for it to exit. Safe to call more than once.
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for RunningHeartbeat {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
