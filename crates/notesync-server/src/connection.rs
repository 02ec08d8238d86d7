//! Per-connection reader and writer.
//!
//! The driver is transport-agnostic: it consumes a stream of [`Frame`]s and
//! writes to a sink of them. The runtime adapts WebSocket messages to frames;
//! tests plug in in-memory channels.

use crate::broadcast::{ConnectionId, Outgoing};
use crate::engine::EngineError;
use crate::runtime::ServerContext;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use notesync_proto::{ChannelMessage, EditPayload, MessageError, SyncRequest, WireFormat};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long the writer may keep flushing after the reader stopped.
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// A transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 frame carrying JSON
    Text(String),
    /// Binary frame carrying CBOR
    Binary(Vec<u8>),
    /// Close request
    Close,
}

impl Frame {
    /// Encode a message in the given format.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn encode(message: &ChannelMessage, format: WireFormat) -> Result<Self, MessageError> {
        match format {
            WireFormat::Json => message.to_json().map(Frame::Text),
            WireFormat::Cbor => message.to_cbor().map(Frame::Binary),
        }
    }

    /// Decode a data frame, returning the message and the format it used.
    /// `Ok(None)` for a close frame.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a valid message.
    pub fn decode(&self) -> Result<Option<(ChannelMessage, WireFormat)>, MessageError> {
        match self {
            Frame::Text(text) => ChannelMessage::from_json(text).map(|m| Some((m, WireFormat::Json))),
            Frame::Binary(bytes) => {
                ChannelMessage::from_cbor(bytes).map(|m| Some((m, WireFormat::Cbor)))
            }
            Frame::Close => Ok(None),
        }
    }
}

/// Why a connection ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Reading from or writing to the transport failed
    #[error("transport error: {0}")]
    Transport(String),
    /// Nothing was received within the idle timeout
    #[error("idle for {0:?}")]
    Idle(Duration),
    /// The connection's outbound queue overflowed and it was dropped
    #[error("dropped for falling behind")]
    Evicted,
}

/// Drive one connection until the client leaves, the transport fails, the
/// server shuts down, or the connection is dropped for falling behind.
///
/// The connection is registered with the broadcaster for its whole
/// lifetime and deregistered on every exit path.
///
/// # Errors
///
/// Returns error if the connection ended for any reason other than a clean
/// close by the client or a server shutdown.
pub async fn serve_connection<S, K, E>(
    ctx: Arc<ServerContext>,
    replica_id: String,
    default_format: WireFormat,
    mut frames: S,
    sink: K,
) -> Result<(), ConnectionError>
where
    S: Stream<Item = Result<Frame, E>> + Unpin + Send,
    E: Display + Send,
    K: Sink<Frame> + Unpin + Send + 'static,
    K::Error: Display,
{
    let registration = ctx.broadcaster.register(&replica_id).await;
    let connection_id = registration.id;
    let mut closed = registration.closed;
    tracing::info!(%connection_id, replica_id = %replica_id, "Replica connected");

    let mut writer = tokio::spawn(write_frames(registration.outbound, sink, default_format));
    let mut writer_done = false;
    let idle_timeout = ctx.config.connection.idle_timeout;

    let result = loop {
        tokio::select! {
            signal = &mut closed => match signal {
                Ok(()) => {
                    tracing::debug!(%connection_id, "Server shutting down, closing connection");
                    break Ok(());
                }
                Err(_) => break Err(ConnectionError::Evicted),
            },
            written = &mut writer, if !writer_done => {
                writer_done = true;
                match written {
                    Ok(Ok(())) => break Ok(()),
                    Ok(Err(err)) => break Err(err),
                    Err(err) => break Err(ConnectionError::Transport(err.to_string())),
                }
            }
            next = next_frame(&mut frames, idle_timeout) => {
                let frame = match next {
                    Err(idle) => break Err(ConnectionError::Idle(idle)),
                    Ok(None) => break Ok(()),
                    Ok(Some(Err(err))) => break Err(ConnectionError::Transport(err.to_string())),
                    Ok(Some(Ok(frame))) => frame,
                };

                match frame.decode() {
                    Ok(Some((message, format))) => {
                        handle_message(&ctx, connection_id, &replica_id, message, format).await;
                    }
                    Ok(None) => break Ok(()),
                    Err(err) => {
                        tracing::warn!(%connection_id, error = %err, "Discarding malformed message");
                    }
                }
            }
        }
    };

    ctx.broadcaster.deregister(connection_id).await;

    if !writer_done {
        if matches!(result, Err(ConnectionError::Evicted)) {
            writer.abort();
        } else if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            tracing::debug!(%connection_id, "Writer did not finish in time");
            writer.abort();
        }
    }

    match &result {
        Ok(()) => tracing::info!(%connection_id, replica_id = %replica_id, "Replica disconnected"),
        Err(err) => {
            tracing::warn!(%connection_id, replica_id = %replica_id, error = %err, "Replica disconnected");
        }
    }
    result
}

async fn next_frame<S, T>(frames: &mut S, idle_timeout: Option<Duration>) -> Result<Option<T>, Duration>
where
    S: Stream<Item = T> + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, frames.next())
            .await
            .map_err(|_| limit),
        None => Ok(frames.next().await),
    }
}

async fn handle_message(
    ctx: &Arc<ServerContext>,
    connection_id: ConnectionId,
    replica_id: &str,
    message: ChannelMessage,
    format: WireFormat,
) {
    tracing::debug!(%connection_id, kind = message.kind(), "Received message");

    match message {
        ChannelMessage::Edit(edit) => handle_edit(ctx, connection_id, edit).await,
        ChannelMessage::Sync(request) => {
            handle_sync(ctx, connection_id, replica_id, request, format).await;
        }
        ChannelMessage::SyncResponse(_) => {
            tracing::warn!(%connection_id, "Ignoring sync_response sent by client");
        }
    }
}

async fn handle_edit(ctx: &Arc<ServerContext>, connection_id: ConnectionId, edit: EditPayload) {
    let engine = Arc::clone(&ctx.engine);
    let document_id = edit.document_id.clone();
    let operation = edit.operation.clone();
    let applied =
        tokio::task::spawn_blocking(move || engine.apply_live_edit(&document_id, operation)).await;

    let accepted = match applied {
        Ok(Ok(Some(op))) => op,
        Ok(Ok(None)) => return,
        Ok(Err(EngineError::NotFound(id))) => {
            tracing::warn!(%connection_id, note_id = %id, "Edit for unknown note discarded");
            return;
        }
        Ok(Err(err)) => {
            tracing::error!(%connection_id, note_id = %edit.document_id, error = %err, "Failed to apply edit");
            return;
        }
        Err(err) => {
            tracing::error!(%connection_id, error = %err, "Edit task failed");
            return;
        }
    };

    let message = ChannelMessage::Edit(EditPayload {
        operation: accepted,
        ..edit
    });
    if let Err(err) = ctx.broadcaster.publish(message).await {
        tracing::error!(%connection_id, error = %err, "Failed to distribute edit");
    }
}

async fn handle_sync(
    ctx: &Arc<ServerContext>,
    connection_id: ConnectionId,
    replica_id: &str,
    request: SyncRequest,
    format: WireFormat,
) {
    if request.replica_id != replica_id {
        tracing::debug!(
            %connection_id,
            connection_replica = replica_id,
            request_replica = %request.replica_id,
            "Sync request names a different replica"
        );
    }

    let engine = Arc::clone(&ctx.engine);
    let synced = tokio::task::spawn_blocking(move || engine.sync(&request)).await;

    let response = match synced {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            tracing::error!(%connection_id, error = %err, "Sync failed");
            return;
        }
        Err(err) => {
            tracing::error!(%connection_id, error = %err, "Sync task failed");
            return;
        }
    };

    let reply = Outgoing::reply(ChannelMessage::SyncResponse(response), format);
    if let Err(err) = ctx.broadcaster.send_to(connection_id, reply).await {
        tracing::warn!(%connection_id, error = %err, "Failed to queue sync response");
    }
}

async fn write_frames<K>(
    mut outbound: mpsc::Receiver<Outgoing>,
    mut sink: K,
    default_format: WireFormat,
) -> Result<(), ConnectionError>
where
    K: Sink<Frame> + Unpin,
    K::Error: Display,
{
    while let Some(item) = outbound.recv().await {
        let format = item.format.unwrap_or(default_format);
        let frame = match Frame::encode(&item.message, format) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(error = %err, kind = item.message.kind(), "Failed to encode message");
                continue;
            }
        };

        sink.send(frame)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
    }

    // Queue closed: the connection was deregistered
    if let Err(err) = sink.send(Frame::Close).await {
        tracing::debug!(error = %err, "Close frame not delivered");
    }
    sink.close()
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))
}
