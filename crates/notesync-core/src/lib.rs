//! # notesync Core
//!
//! Causality tracking, replicated text, and merge ordering for notesync.
//!
//! This crate provides:
//! - Vector clocks for per-replica causal ordering
//! - An operation-based replicated text type with a materialized cache
//! - Deterministic ordering and replay of concurrent edits
//! - The note model that wraps a replicated text for storage and sync

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod crdt;
pub mod document;
pub mod merge;

pub use clock::{ClockError, ClockOrdering, VectorClock};
pub use crdt::{CrdtError, OpKind, Operation, TextCrdt};
pub use document::{Note, NoteId};
