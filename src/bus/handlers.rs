use super::protocol::*;
use super::server::BusServer;
use super::types::MessageEnvelope;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json, extract::Path, http::StatusCode};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub async fn handle_ping() -> (StatusCode, Json<Ack>) {
    (StatusCode::OK, Json(Ack::default()))
}

pub async fn handle_register(
    Extension(server): Extension<Arc<BusServer>>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<Ack>) {
    if server.is_stopped() {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(Ack::default()));
    }
    server.register(&req.host_id);
    (StatusCode::OK, Json(Ack::default()))
}

pub async fn handle_send(
    Extension(server): Extension<Arc<BusServer>>,
    Json(envelope): Json<MessageEnvelope>,
) -> (StatusCode, Json<Ack>) {
    server.send_message(envelope);
    (StatusCode::OK, Json(Ack::default()))
}

/// Removes the host's queue when the streaming response is dropped.
struct StreamGuard {
    server: Arc<BusServer>,
    host_id: String,
    generation: u64,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.server.release(&self.host_id, self.generation);
    }
}

pub async fn handle_receive(
    Extension(server): Extension<Arc<BusServer>>,
    Path(host_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let receiver = server
        .take_receiver(&host_id)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;

    tracing::debug!("Host {} opened its receive stream", host_id);

    let guard = StreamGuard {
        server: server.clone(),
        host_id: receiver.host_id,
        generation: receiver.generation,
    };

    let stream = UnboundedReceiverStream::new(receiver.rx).filter_map(move |envelope| {
        let _guard = &guard;
        let event = match serde_json::to_string(&envelope) {
            Ok(json) => Some(Ok(Event::default().data(json))),
            Err(e) => {
                tracing::warn!("Failed to encode {} envelope: {}", envelope.type_tag, e);
                None
            }
        };
        futures::future::ready(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}
