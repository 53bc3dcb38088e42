//! File transfer relay.
//!
//! The server pairs an upload (`POST /stream/:id`) from the source host with a
//! download (`GET /stream/:id`) from the receiving host. Bytes flow through a
//! bounded channel, so neither side buffers the whole archive. A slot whose
//! peer never shows up is dropped once the transfer timeout passes.

use crate::bus::{MessageBus, MessageBusExt};
use crate::model::messages::{HostFileTransfer, StartFileTransferRead, StartFileTransferWrite};
use crate::workspace::transfer::ENDPOINT_STREAM;

use axum::{
    Extension, Router,
    body::Body,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

const RELAY_CHANNEL_CAPACITY: usize = 16;

type Chunk = Result<Bytes, std::io::Error>;

struct StreamSlot {
    generation: u64,
    tx: Option<mpsc::Sender<Chunk>>,
    rx: Option<mpsc::Receiver<Chunk>>,
}

pub struct FileTransferRelay {
    slots: DashMap<Uuid, StreamSlot>,
    next_generation: AtomicU64,
    slot_timeout: Duration,
}

impl FileTransferRelay {
    pub fn new(slot_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            next_generation: AtomicU64::new(0),
            slot_timeout,
        })
    }

    /// Takes transfer requests from `bus`. Routes may be served before this is called.
    pub fn init(self: &Arc<Self>, bus: &Arc<dyn MessageBus>) {
        let this = self.clone();
        let sender = bus.clone();
        bus.on_message(move |_sender, msg: HostFileTransfer| {
            let this = this.clone();
            let bus = sender.clone();
            async move {
                this.handle_host_file_transfer(bus.as_ref(), msg).await;
                Ok(())
            }
        });
    }

    /// Routes served next to the bus endpoints.
    pub fn routes(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                &format!("{}/:stream_id", ENDPOINT_STREAM),
                get(handle_download).post(handle_upload),
            )
            .layer(Extension(self.clone()))
    }

    pub async fn handle_host_file_transfer(
        self: &Arc<Self>,
        bus: &dyn MessageBus,
        message: HostFileTransfer,
    ) {
        tracing::debug!(
            "Creating stream {} from {} to {}",
            message.stream_id,
            message.sender_id,
            message.receiver_id
        );
        self.open_slot(message.stream_id);

        bus.send(
            &message.sender_id,
            &StartFileTransferWrite {
                stream_id: message.stream_id,
                requested_path: message.source_path,
            },
        )
        .await;
        bus.send(
            &message.receiver_id,
            &StartFileTransferRead {
                stream_id: message.stream_id,
            },
        )
        .await;
    }

    /// Opens the slot and schedules its expiry. Must run inside a tokio runtime.
    pub fn open_slot(self: &Arc<Self>, stream_id: Uuid) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
        self.slots.insert(
            stream_id,
            StreamSlot {
                generation,
                tx: Some(tx),
                rx: Some(rx),
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.slot_timeout).await;
            this.expire_slot(stream_id, generation);
        });
    }

    /// Drops a slot still waiting for one of its ends. Dropping the half that
    /// was never claimed ends the other side's stream.
    fn expire_slot(&self, stream_id: Uuid, generation: u64) {
        if self
            .slots
            .remove_if(&stream_id, |_, slot| slot.generation == generation)
            .is_some()
        {
            tracing::warn!(
                "Stream {} expired after {:?} without both ends connecting",
                stream_id,
                self.slot_timeout
            );
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn has_slot(&self, stream_id: Uuid) -> bool {
        self.slots.contains_key(&stream_id)
    }

    fn take_sender(&self, stream_id: Uuid) -> Option<mpsc::Sender<Chunk>> {
        let tx = self.slots.get_mut(&stream_id)?.tx.take();
        self.drop_if_drained(stream_id);
        tx
    }

    pub(crate) fn take_receiver(&self, stream_id: Uuid) -> Option<mpsc::Receiver<Chunk>> {
        let rx = self.slots.get_mut(&stream_id)?.rx.take();
        self.drop_if_drained(stream_id);
        rx
    }

    fn drop_if_drained(&self, stream_id: Uuid) {
        self.slots
            .remove_if(&stream_id, |_, slot| slot.tx.is_none() && slot.rx.is_none());
    }
}

async fn handle_upload(
    Extension(relay): Extension<Arc<FileTransferRelay>>,
    Path(stream_id): Path<Uuid>,
    body: Body,
) -> StatusCode {
    let Some(tx) = relay.take_sender(stream_id) else {
        tracing::warn!("Upload for unknown stream {}", stream_id);
        return StatusCode::NOT_FOUND;
    };

    let mut data = body.into_data_stream();
    let mut total = 0usize;
    while let Some(chunk) = data.next().await {
        match chunk {
            Ok(bytes) => {
                total += bytes.len();
                if tx.send(Ok(bytes)).await.is_err() {
                    tracing::warn!("Receiver of stream {} went away", stream_id);
                    return StatusCode::GONE;
                }
            }
            Err(e) => {
                tracing::warn!("Upload of stream {} broke off: {}", stream_id, e);
                let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                return StatusCode::BAD_REQUEST;
            }
        }
    }

    tracing::debug!("Relayed {} bytes on stream {}", total, stream_id);
    StatusCode::OK
}

async fn handle_download(
    Extension(relay): Extension<Arc<FileTransferRelay>>,
    Path(stream_id): Path<Uuid>,
) -> Response {
    match relay.take_receiver(stream_id) {
        Some(rx) => Body::from_stream(ReceiverStream::new(rx)).into_response(),
        None => {
            tracing::warn!("Download for unknown stream {}", stream_id);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
