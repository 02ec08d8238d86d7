//! Server runtime orchestration.

use crate::broadcast::Broadcaster;
use crate::config::{parse_wire_format, ServerConfig, StoreType};
use crate::connection::{serve_connection, Frame};
use crate::engine::SyncEngine;
use crate::persistence::{MemoryStore, NoteStore, SqliteStore};
use anyhow::{Context, Result};
use futures_util::{future, SinkExt, StreamExt};
use notesync_proto::WireFormat;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;
use uuid::Uuid;

/// How long open connections get to close after shutdown before their
/// tasks are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state for every connection, created once at server start.
pub struct ServerContext {
    /// Active configuration
    pub config: ServerConfig,
    /// Note reconciliation and live edit application
    pub engine: Arc<SyncEngine>,
    /// Connection registry and live edit fan-out
    pub broadcaster: Arc<Broadcaster>,
}

impl ServerContext {
    /// Build the context over an already opened store and start the
    /// broadcaster's distribution task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn new(config: ServerConfig, store: Arc<dyn NoteStore>) -> Arc<Self> {
        let engine = SyncEngine::new(store).with_live_edit_dedup(config.engine.dedupe_live_edits);
        let broadcaster = Broadcaster::start(
            config.broadcast.distribution_capacity,
            config.broadcast.outbound_capacity,
        );

        Arc::new(Self {
            config,
            engine: Arc::new(engine),
            broadcaster,
        })
    }
}

/// Parameters a client passes in the WebSocket request URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ConnectParams {
    replica_id: Option<String>,
    format: Option<WireFormat>,
}

impl ConnectParams {
    fn from_request_target(target: &str) -> Self {
        let mut params = Self::default();
        let Ok(url) = Url::parse(&format!("ws://localhost{target}")) else {
            return params;
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "replica_id" | "client_id" if !value.is_empty() => {
                    params.replica_id = Some(value.into_owned());
                }
                "format" => match parse_wire_format(&value) {
                    Ok(format) => params.format = Some(format),
                    Err(err) => tracing::debug!(error = %err, "Ignoring format parameter"),
                },
                _ => {}
            }
        }
        params
    }
}

/// The notes sync server.
pub struct Server {
    context: Arc<ServerContext>,
}

impl Server {
    /// Create a server, opening the configured store.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be opened.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store: Arc<dyn NoteStore> = match config.persistence.store_type {
            StoreType::Sqlite => Arc::new(
                SqliteStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            ),
            StoreType::Memory => Arc::new(MemoryStore::new()),
        };

        tracing::info!(
            store = ?config.persistence.store_type,
            db_path = %config.persistence.db_path.display(),
            "Note store opened"
        );

        Ok(Self {
            context: ServerContext::new(config, store),
        })
    }

    /// Shared context, for embedding and tests.
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Bind the configured address and serve until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.context.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.context.config.bind_addr))?;

        self.serve(listener, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
                future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accept WebSocket connections on `listener` until `shutdown` resolves,
    /// then close every open connection before returning.
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        tracing::info!(%addr, "Server listening, press Ctrl+C to stop");

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let context = Arc::clone(&self.context);
                            connections.spawn(async move {
                                if let Err(err) = handle_socket(context, stream, peer).await {
                                    tracing::warn!(%peer, error = %err, "WebSocket handshake failed");
                                }
                            });
                        }
                        Err(err) => tracing::warn!(error = %err, "Failed to accept connection"),
                    }
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "Connection task failed");
                    }
                }

                () = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        self.close_connections(connections).await;

        tracing::info!("Server stopped");
        Ok(())
    }

    async fn close_connections(&self, mut connections: JoinSet<()>) {
        let open = self.context.broadcaster.disconnect_all().await;
        tracing::info!(open, tasks = connections.len(), "Closing connections");

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "Connections did not close in time, aborting"
            );
            connections.shutdown().await;
            self.context.broadcaster.disconnect_all().await;
        }
    }
}

async fn handle_socket(
    context: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut params = ConnectParams::default();
    let socket = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let target = request
                .uri()
                .path_and_query()
                .map_or("/", |target| target.as_str());
            params = ConnectParams::from_request_target(target);
            Ok(response)
        },
    )
    .await
    .context("WebSocket handshake")?;

    let replica_id = params
        .replica_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let format = params
        .format
        .unwrap_or(context.config.connection.wire_format);
    tracing::debug!(%peer, replica_id = %replica_id, ?format, "WebSocket established");

    let (sink, stream) = socket.split();
    let frames = Box::pin(stream.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes.to_vec()))),
            Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
            Ok(_) => None,
            Err(err) => Some(Err(err)),
        })
    }));
    let sink = Box::pin(sink.with(|frame: Frame| {
        future::ready(Ok::<_, tungstenite::Error>(match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
            Frame::Close => Message::Close(None),
        }))
    }));

    // Abnormal ends are logged by the driver itself
    let _ = serve_connection(context, replica_id, format, frames, sink).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_params_read_replica_and_format() {
        let params = ConnectParams::from_request_target("/ws?replica_id=laptop&format=cbor");
        assert_eq!(params.replica_id.as_deref(), Some("laptop"));
        assert_eq!(params.format, Some(WireFormat::Cbor));

        let legacy = ConnectParams::from_request_target("/?client_id=phone");
        assert_eq!(legacy.replica_id.as_deref(), Some("phone"));
        assert_eq!(legacy.format, None);
    }

    #[test]
    fn connect_params_ignore_empty_and_unknown() {
        let params = ConnectParams::from_request_target("/?replica_id=&format=xml&other=1");
        assert_eq!(params, ConnectParams::default());
        assert_eq!(ConnectParams::from_request_target("/"), ConnectParams::default());
    }

    #[tokio::test]
    async fn memory_server_builds_context() {
        let mut config = ServerConfig::default();
        config.persistence.store_type = StoreType::Memory;

        let server = Server::new(config).unwrap();

        assert!(server.context().engine.list_notes().unwrap().is_empty());
        assert_eq!(server.context().broadcaster.connection_count().await, 0);
    }
}
