//! # notesync Server
//!
//! Synchronization engine and live edit server for notesync.
//!
//! ## Architecture
//!
//! Every connection runs two tasks, plus one shared distribution task:
//! 1. **Reader**: decodes frames and hands edits and sync requests to the
//!    engine, whose storage work runs on the blocking pool
//! 2. **Writer**: drains the connection's bounded outbound queue in order
//! 3. **Distribution**: drains the shared queue of accepted edits and
//!    enqueues each one for every registered connection without waiting;
//!    a connection that cannot keep up is dropped
//!
//! The engine serializes read-modify-write per note, so concurrent edits to
//! one note never overwrite each other.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod engine;
pub mod persistence;
pub mod runtime;

pub use broadcast::{BroadcastError, BroadcastStats, Broadcaster, ConnectionId, Outgoing};
pub use config::ServerConfig;
pub use connection::{serve_connection, ConnectionError, Frame};
pub use engine::{EngineError, ReconcileOutcome, Reconciled, SyncEngine};
pub use persistence::{MemoryStore, NoteStore, SqliteStore, StoreError};
pub use runtime::{Server, ServerContext};
