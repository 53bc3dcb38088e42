//! Tar-over-HTTP file transfer.
//!
//! A receiver asks the server to relay a folder from a source host:
//! 1. Receiver sends `HostFileTransfer` to the server and waits.
//! 2. The server opens a stream slot and tells the source to write and the receiver to read.
//! 3. The source tars the folder into `POST /stream/:id`.
//! 4. The receiver unpacks `GET /stream/:id` into its destination.

use super::FileTransfer;
use crate::bus::{MessageBus, MessageBusExt};
use crate::config::{ServerConnectionConfig, WorkspaceConfig};
use crate::model::messages::{HostFileTransfer, StartFileTransferRead, StartFileTransferWrite};
use crate::model::types::RemotePathInfo;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::TryStreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use uuid::Uuid;

pub const ENDPOINT_STREAM: &str = "/stream";

/// In-memory pipe between the tar writer and the upload body.
const UPLOAD_PIPE_CAPACITY: usize = 64 * 1024;

struct PendingDownload {
    dest: PathBuf,
    done: oneshot::Sender<Result<()>>,
}

pub struct HttpFileTransfer {
    bus: Arc<dyn MessageBus>,
    connection: ServerConnectionConfig,
    timeout: Duration,
    http_client: reqwest::Client,
    pending: DashMap<Uuid, PendingDownload>,
}

impl HttpFileTransfer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        connection: ServerConnectionConfig,
        workspace: &WorkspaceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            connection,
            timeout: workspace.transfer_timeout,
            http_client: reqwest::Client::new(),
            pending: DashMap::new(),
        })
    }

    /// Subscribes to the relay's read/write instructions.
    pub fn init(self: &Arc<Self>) {
        let this = self.clone();
        self.bus.on_message(move |_sender, msg: StartFileTransferWrite| {
            let this = this.clone();
            async move { this.upload(msg.stream_id, PathBuf::from(msg.requested_path)).await }
        });

        let this = self.clone();
        self.bus.on_message(move |_sender, msg: StartFileTransferRead| {
            let this = this.clone();
            async move {
                this.download(msg.stream_id).await;
                Ok(())
            }
        });
    }

    fn stream_url(&self, stream_id: Uuid) -> String {
        self.connection
            .url(&format!("{}/{}", ENDPOINT_STREAM, stream_id))
    }

    async fn upload(&self, stream_id: Uuid, folder: PathBuf) -> Result<()> {
        tracing::debug!("Uploading {:?} to stream {}", folder, stream_id);

        let (writer, reader) = tokio::io::duplex(UPLOAD_PIPE_CAPACITY);
        let bridge = SyncIoBridge::new(writer);
        let packer = tokio::task::spawn_blocking(move || pack_folder(&folder, bridge));

        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));
        let response = self
            .http_client
            .post(self.stream_url(stream_id))
            .body(body)
            .send()
            .await
            .context("Upload request failed")?;

        packer.await??;
        response
            .error_for_status()
            .context("Upload rejected by server")?;

        tracing::debug!("Completed upload to stream {}", stream_id);
        Ok(())
    }

    async fn download(&self, stream_id: Uuid) {
        let Some((_, pending)) = self.pending.remove(&stream_id) else {
            tracing::debug!("No download waiting on stream {}, ignoring", stream_id);
            return;
        };

        let result = self.fetch_into(stream_id, pending.dest).await;
        if let Err(e) = &result {
            tracing::error!("Download of stream {} failed: {:#}", stream_id, e);
        }
        let _ = pending.done.send(result);
    }

    async fn fetch_into(&self, stream_id: Uuid, dest: PathBuf) -> Result<()> {
        let response = self
            .http_client
            .get(self.stream_url(stream_id))
            .send()
            .await?
            .error_for_status()?;

        let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let bridge = SyncIoBridge::new(StreamReader::new(stream));

        tracing::debug!("Extracting stream {} into {:?}", stream_id, dest);
        tokio::task::spawn_blocking(move || {
            tar::Archive::new(bridge)
                .unpack(&dest)
                .with_context(|| format!("Failed to unpack into {:?}", dest))
        })
        .await??;

        Ok(())
    }
}

fn pack_folder<W: Write>(folder: &Path, writer: W) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder
        .append_dir_all(".", folder)
        .with_context(|| format!("Failed to pack {:?}", folder))?;
    builder.into_inner()?.flush()?;
    Ok(())
}

#[async_trait]
impl FileTransfer for HttpFileTransfer {
    async fn copy_remote_files(&self, source: &RemotePathInfo, local_dest: &Path) -> Result<()> {
        let stream_id = Uuid::new_v4();
        let (done_tx, done_rx) = oneshot::channel();
        self.pending.insert(
            stream_id,
            PendingDownload {
                dest: local_dest.to_path_buf(),
                done: done_tx,
            },
        );

        self.bus
            .send(
                &self.connection.server_id,
                &HostFileTransfer {
                    sender_id: source.host_id.clone(),
                    receiver_id: self.bus.host_id(),
                    stream_id,
                    source_path: source.source_path.clone(),
                },
            )
            .await;

        match tokio::time::timeout(self.timeout, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(anyhow::anyhow!("Transfer {} was abandoned", stream_id)),
            Err(_) => {
                self.pending.remove(&stream_id);
                Err(anyhow::anyhow!(
                    "Timed out after {:?} copying {} from {}",
                    self.timeout,
                    source.source_path,
                    source.host_id
                ))
            }
        }
    }
}
