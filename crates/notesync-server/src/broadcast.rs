//! Fan-out of accepted live edits to every connected replica.
//!
//! Accepted edits go onto one shared bounded distribution queue. A single
//! distribution task drains it and does a non-blocking enqueue onto each
//! connection's own bounded outbound queue. A connection whose queue is
//! full is deregistered on the spot, which closes its queue and signals
//! its driver to disconnect. One slow consumer never stalls the others.
//!
//! On server shutdown every connection is told to close instead; its
//! writer still flushes whatever is already queued.
//!
//! The originator of an edit is a registered connection like any other, so
//! it receives its own edit back as confirmation.

use notesync_proto::{ChannelMessage, WireFormat};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

/// Identifies one registered connection.
pub type ConnectionId = Uuid;

/// An item waiting in a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// The message to write
    pub message: Arc<ChannelMessage>,
    /// Encoding override; `None` uses the connection's default
    pub format: Option<WireFormat>,
}

impl Outgoing {
    /// A distributed message, written in the connection's default format.
    #[must_use]
    pub fn broadcast(message: Arc<ChannelMessage>) -> Self {
        Self {
            message,
            format: None,
        }
    }

    /// A direct reply, written in the format of the request.
    #[must_use]
    pub fn reply(message: ChannelMessage, format: WireFormat) -> Self {
        Self {
            message: Arc::new(message),
            format: Some(format),
        }
    }
}

/// What a connection driver gets back from [`Broadcaster::register`].
#[derive(Debug)]
pub struct Registration {
    /// The connection's identity in the registry
    pub id: ConnectionId,
    /// The connection's outbound queue
    pub outbound: mpsc::Receiver<Outgoing>,
    /// Resolves with `Ok` when the server is shutting down and with an
    /// error once the connection has been deregistered
    pub closed: oneshot::Receiver<()>,
}

/// Registry entry. Dropping it closes the outbound queue and fires the
/// eviction signal.
struct ConnectionHandle {
    replica_id: String,
    outbound: mpsc::Sender<Outgoing>,
    closer: oneshot::Sender<()>,
}

type Registry = Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>;

/// Broadcast health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Messages accepted onto the distribution queue
    pub messages_published: u64,
    /// Per-connection enqueues that succeeded
    pub messages_delivered: u64,
    /// Connections dropped because their queue was full
    pub connections_dropped: u64,
    /// Currently registered connections
    pub active_connections: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_published: AtomicU64,
    messages_delivered: AtomicU64,
    connections_dropped: AtomicU64,
}

/// Connection registry plus the shared distribution queue.
pub struct Broadcaster {
    connections: Registry,
    distribution: mpsc::Sender<Arc<ChannelMessage>>,
    outbound_capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl Broadcaster {
    /// Create a broadcaster and spawn its distribution task.
    ///
    /// Capacities below one are raised to one. The distribution task ends
    /// once the broadcaster is dropped.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn start(distribution_capacity: usize, outbound_capacity: usize) -> Arc<Self> {
        let (distribution, queue) = mpsc::channel(distribution_capacity.max(1));
        let connections = Registry::default();
        let stats = Arc::new(AtomicBroadcastStats::default());

        tokio::spawn(distribute(
            queue,
            Arc::clone(&connections),
            Arc::clone(&stats),
        ));

        Arc::new(Self {
            connections,
            distribution,
            outbound_capacity: outbound_capacity.max(1),
            stats,
        })
    }

    /// Register a connection and hand back its outbound queue.
    pub async fn register(&self, replica_id: &str) -> Registration {
        let id = Uuid::new_v4();
        let (outbound_tx, outbound) = mpsc::channel(self.outbound_capacity);
        let (closer, closed) = oneshot::channel();

        let mut connections = self.connections.write().await;
        connections.insert(
            id,
            ConnectionHandle {
                replica_id: replica_id.to_string(),
                outbound: outbound_tx,
                closer,
            },
        );
        tracing::debug!(connection_id = %id, replica_id, total = connections.len(), "Registered connection");

        Registration {
            id,
            outbound,
            closed,
        }
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&id);
        if let Some(handle) = &removed {
            tracing::debug!(connection_id = %id, replica_id = %handle.replica_id, "Deregistered connection");
        }
        removed.is_some()
    }

    /// Deregister every connection, telling each driver the server is
    /// shutting down. Returns how many connections were registered.
    pub async fn disconnect_all(&self) -> usize {
        let drained: Vec<(ConnectionId, ConnectionHandle)> =
            self.connections.write().await.drain().collect();

        let count = drained.len();
        for (id, handle) in drained {
            let ConnectionHandle {
                replica_id, closer, ..
            } = handle;
            if closer.send(()).is_err() {
                tracing::debug!(connection_id = %id, replica_id = %replica_id, "Connection already gone");
            }
        }
        tracing::debug!(count, "Disconnected all connections");
        count
    }

    /// Queue a message for distribution to every registered connection.
    ///
    /// Waits while the distribution queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::Closed`] if the distribution task is gone.
    pub async fn publish(&self, message: ChannelMessage) -> Result<(), BroadcastError> {
        self.distribution
            .send(Arc::new(message))
            .await
            .map_err(|_| BroadcastError::Closed)?;
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue a message for one connection without waiting.
    ///
    /// A full queue deregisters the connection, exactly as in distribution.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is not registered, its queue was
    /// full, or its queue is already closed.
    pub async fn send_to(&self, id: ConnectionId, item: Outgoing) -> Result<(), BroadcastError> {
        let sent = {
            let connections = self.connections.read().await;
            let handle = connections
                .get(&id)
                .ok_or(BroadcastError::NotRegistered(id))?;
            handle.outbound.try_send(item)
        };

        match sent {
            Ok(()) => {
                self.stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %id, "Outbound queue full, dropping connection");
                if self.deregister(id).await {
                    self.stats.connections_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(BroadcastError::QueueFull(id))
            }
            Err(TrySendError::Closed(_)) => {
                self.deregister(id).await;
                Err(BroadcastError::NotRegistered(id))
            }
        }
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Snapshot of the broadcast counters.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            messages_delivered: self.stats.messages_delivered.load(Ordering::Relaxed),
            connections_dropped: self.stats.connections_dropped.load(Ordering::Relaxed),
            active_connections: self.connection_count().await,
        }
    }
}

async fn distribute(
    mut queue: mpsc::Receiver<Arc<ChannelMessage>>,
    connections: Registry,
    stats: Arc<AtomicBroadcastStats>,
) {
    while let Some(message) = queue.recv().await {
        let mut stale = Vec::new();
        {
            let connections = connections.read().await;
            for (id, handle) in connections.iter() {
                match handle.outbound.try_send(Outgoing::broadcast(Arc::clone(&message))) {
                    Ok(()) => {
                        stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            connection_id = %id,
                            replica_id = %handle.replica_id,
                            kind = message.kind(),
                            "Outbound queue full, dropping connection"
                        );
                        stale.push((*id, true));
                    }
                    Err(TrySendError::Closed(_)) => stale.push((*id, false)),
                }
            }
        }

        if !stale.is_empty() {
            let mut connections = connections.write().await;
            for (id, saturated) in stale {
                if connections.remove(&id).is_some() && saturated {
                    stats.connections_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    tracing::debug!("Distribution queue closed");
}

/// Errors from the broadcaster.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    /// No such connection
    #[error("connection not registered: {0}")]
    NotRegistered(ConnectionId),
    /// The connection's outbound queue was full; it has been dropped
    #[error("outbound queue full for connection {0}")]
    QueueFull(ConnectionId),
    /// The distribution task has stopped
    #[error("distribution queue closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use notesync_core::TextCrdt;
    use notesync_proto::{EditPayload, SyncResponse};
    use std::time::Duration;
    use tokio::sync::oneshot::error::TryRecvError;
    use tokio_test::{assert_ok, assert_pending, assert_ready_err, task};
    use tokio::time::timeout;

    fn edit(n: usize) -> ChannelMessage {
        let mut crdt = TextCrdt::new();
        ChannelMessage::Edit(EditPayload {
            document_id: "n1".to_string(),
            replica_id: "c1".to_string(),
            operation: crdt.create_insert("c1", n, "x"),
        })
    }

    async fn recv(reg: &mut Registration) -> Option<Outgoing> {
        timeout(Duration::from_secs(2), reg.outbound.recv())
            .await
            .expect("timed out waiting for outbound message")
    }

    #[tokio::test]
    async fn publish_reaches_every_connection_including_sender() {
        let broadcaster = Broadcaster::start(16, 16);
        let mut origin = broadcaster.register("c1").await;
        let mut peer = broadcaster.register("c2").await;

        assert_ok!(broadcaster.publish(edit(0)).await);

        let to_origin = recv(&mut origin).await.unwrap();
        let to_peer = recv(&mut peer).await.unwrap();
        assert_eq!(to_origin.message.kind(), "edit");
        assert!(Arc::ptr_eq(&to_origin.message, &to_peer.message));
        assert!(to_peer.format.is_none());
    }

    #[tokio::test]
    async fn saturated_connection_is_dropped_without_stalling_others() {
        let broadcaster = Broadcaster::start(16, 4);
        let mut stalled = broadcaster.register("slow").await;
        let mut healthy = broadcaster.register("fast").await;

        for n in 0..6 {
            broadcaster.publish(edit(n)).await.unwrap();
            let item = recv(&mut healthy).await.unwrap();
            let ChannelMessage::Edit(payload) = &*item.message else {
                panic!("expected edit");
            };
            assert_eq!(payload.operation.position, n);
        }

        let mut buffered = 0;
        while recv(&mut stalled).await.is_some() {
            buffered += 1;
        }
        assert_eq!(buffered, 4);
        assert!(matches!(
            stalled.closed.try_recv(),
            Err(TryRecvError::Closed)
        ));

        assert_eq!(broadcaster.connection_count().await, 1);
        let stats = broadcaster.stats().await;
        assert_eq!(stats.messages_published, 6);
        assert_eq!(stats.messages_delivered, 10);
        assert_eq!(stats.connections_dropped, 1);
    }

    #[tokio::test]
    async fn send_to_unknown_connection_fails() {
        let broadcaster = Broadcaster::start(4, 4);
        let reply = Outgoing::reply(
            ChannelMessage::SyncResponse(SyncResponse::default()),
            WireFormat::Json,
        );

        assert!(matches!(
            broadcaster.send_to(Uuid::new_v4(), reply).await,
            Err(BroadcastError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn send_to_full_queue_deregisters() {
        let broadcaster = Broadcaster::start(4, 1);
        let mut reg = broadcaster.register("c1").await;
        let reply = || {
            Outgoing::reply(
                ChannelMessage::SyncResponse(SyncResponse::default()),
                WireFormat::Cbor,
            )
        };

        broadcaster.send_to(reg.id, reply()).await.unwrap();
        assert!(matches!(
            broadcaster.send_to(reg.id, reply()).await,
            Err(BroadcastError::QueueFull(_))
        ));

        assert_eq!(broadcaster.connection_count().await, 0);
        let first = recv(&mut reg).await.unwrap();
        assert_eq!(first.format, Some(WireFormat::Cbor));
        assert!(recv(&mut reg).await.is_none());
    }

    #[tokio::test]
    async fn deregister_signals_eviction() {
        let broadcaster = Broadcaster::start(4, 4);
        let reg = broadcaster.register("c1").await;
        let mut evicted = task::spawn(reg.closed);
        assert_pending!(evicted.poll());

        assert!(broadcaster.deregister(reg.id).await);
        assert!(!broadcaster.deregister(reg.id).await);

        assert!(evicted.is_woken());
        assert_ready_err!(evicted.poll());
    }

    #[tokio::test]
    async fn disconnect_all_signals_shutdown_and_keeps_queued_items() {
        let broadcaster = Broadcaster::start(4, 4);
        let mut first = broadcaster.register("c1").await;
        let mut second = broadcaster.register("c2").await;

        broadcaster.publish(edit(0)).await.unwrap();
        assert!(recv(&mut first).await.is_some());
        broadcaster
            .send_to(
                second.id,
                Outgoing::reply(
                    ChannelMessage::SyncResponse(SyncResponse::default()),
                    WireFormat::Json,
                ),
            )
            .await
            .unwrap();

        assert_eq!(broadcaster.disconnect_all().await, 2);
        assert_eq!(broadcaster.connection_count().await, 0);
        assert_eq!(broadcaster.disconnect_all().await, 0);

        assert_ok!(first.closed.try_recv());
        assert_ok!(second.closed.try_recv());
        // Queued items are still delivered before the queue ends
        let mut remaining = 0;
        while recv(&mut second).await.is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 2);
        assert!(recv(&mut first).await.is_none());
    }

    #[tokio::test]
    async fn zero_capacities_are_clamped() {
        let broadcaster = Broadcaster::start(0, 0);
        let mut reg = broadcaster.register("c1").await;

        broadcaster.publish(edit(0)).await.unwrap();

        assert!(recv(&mut reg).await.is_some());
        assert_eq!(broadcaster.outbound_capacity, 1);
    }
}
