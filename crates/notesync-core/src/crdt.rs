//! Operation-based replicated text for notesync.
//!
//! The replicated state is an append-only log of single-character edits
//! plus a cached text that is always the replay of that log in the
//! canonical order defined in [`crate::merge`].

use crate::clock::VectorClock;
use crate::merge;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The kind of a text operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// Splice content in at a position
    Insert,
    /// Remove exactly one character at a position
    Delete,
}

/// A single immutable edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Stable identity derived from replica ID and clock snapshot
    pub id: String,
    /// Replica that originated the edit
    #[serde(alias = "client_id")]
    pub replica_id: String,
    /// Clock snapshot taken when the edit was created
    pub clock: VectorClock,
    /// Insert or delete
    #[serde(rename = "type")]
    pub kind: OpKind,
    /// Character index into the materialized text
    pub position: usize,
    /// Inserted content (empty for deletes)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    /// Wall-clock creation time, used to order concurrent edits
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    /// Create an insert operation.
    #[must_use]
    pub fn insert(
        replica_id: impl Into<String>,
        clock: VectorClock,
        position: usize,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let replica_id = replica_id.into();
        Self {
            id: Self::derive_id(&replica_id, &clock),
            replica_id,
            clock,
            kind: OpKind::Insert,
            position,
            content: content.into(),
            timestamp,
        }
    }

    /// Create a single-character delete operation.
    #[must_use]
    pub fn delete(
        replica_id: impl Into<String>,
        clock: VectorClock,
        position: usize,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let replica_id = replica_id.into();
        Self {
            id: Self::derive_id(&replica_id, &clock),
            replica_id,
            clock,
            kind: OpKind::Delete,
            position,
            content: String::new(),
            timestamp,
        }
    }

    /// Derive the operation ID for a replica and clock snapshot.
    #[must_use]
    pub fn derive_id(replica_id: &str, clock: &VectorClock) -> String {
        format!("{replica_id}-{clock}")
    }
}

/// Replicated text: operation log, materialized text, and clock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "TextCrdtRepr")]
pub struct TextCrdt {
    operations: Vec<Operation>,
    text: String,
    clock: VectorClock,
    /// Merge of every logged operation's clock
    #[serde(skip)]
    frontier: VectorClock,
}

/// Wire form of [`TextCrdt`]. A cached text, when present, is taken as is;
/// without one the text is rebuilt from the operations.
#[derive(Deserialize)]
struct TextCrdtRepr {
    #[serde(default)]
    operations: Vec<Operation>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    clock: VectorClock,
}

impl From<TextCrdtRepr> for TextCrdt {
    fn from(repr: TextCrdtRepr) -> Self {
        let mut frontier = VectorClock::new();
        for op in &repr.operations {
            frontier.merge(&op.clock);
        }

        let mut crdt = Self {
            operations: repr.operations,
            text: String::new(),
            clock: repr.clock,
            frontier,
        };
        match repr.text {
            Some(text) => crdt.text = text,
            None => crdt.rebuild(),
        }
        crdt
    }
}

impl TextCrdt {
    /// Create an empty replicated text.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The materialized text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The operation log in application order.
    #[must_use]
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// The clock summarizing every applied operation.
    #[must_use]
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Check whether an operation ID is already in the log.
    #[must_use]
    pub fn contains(&self, op_id: &str) -> bool {
        self.operations.iter().any(|op| op.id == op_id)
    }

    /// Apply an operation.
    ///
    /// This does not check for duplicates: applying the same operation
    /// twice appends it twice. Callers that may see re-deliveries should
    /// check [`contains`](Self::contains) first or use [`merge`](Self::merge).
    ///
    /// An operation that causally follows everything already logged is
    /// applied to the cached text directly; any other forces a rebuild.
    pub fn apply(&mut self, op: Operation) {
        let follows_all = self.frontier.happens_before(&op.clock);
        self.clock.merge(&op.clock);
        self.frontier.merge(&op.clock);

        if follows_all {
            merge::apply_one(&mut self.text, &op);
            self.operations.push(op);
        } else {
            self.operations.push(op);
            self.rebuild();
        }
    }

    /// Apply several operations, rebuilding the text once.
    pub fn apply_all(&mut self, ops: impl IntoIterator<Item = Operation>) {
        for op in ops {
            self.clock.merge(&op.clock);
            self.frontier.merge(&op.clock);
            self.operations.push(op);
        }
        self.rebuild();
    }

    /// Merge another replica's log into this one.
    ///
    /// Only operations whose ID is not already present are appended, so
    /// merging the same source twice is a no-op. Returns the operations
    /// that were added.
    pub fn merge(&mut self, other: &Self) -> Vec<Operation> {
        let existing: HashSet<&str> = self.operations.iter().map(|op| op.id.as_str()).collect();
        let unseen: Vec<Operation> = other
            .operations
            .iter()
            .filter(|op| !existing.contains(op.id.as_str()))
            .cloned()
            .collect();

        if !unseen.is_empty() {
            self.apply_all(unseen.iter().cloned());
        }
        tracing::debug!(
            added = unseen.len(),
            total = self.operations.len(),
            "Merged replicated text"
        );
        unseen
    }

    /// Operations not causally before-or-equal to `since`.
    #[must_use]
    pub fn operations_since(&self, since: &VectorClock) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| !op.clock.dominated_by(since))
            .cloned()
            .collect()
    }

    /// Create an insert originating at `replica_id`.
    ///
    /// Advances this replica's clock; the returned operation still has to
    /// be applied.
    pub fn create_insert(
        &mut self,
        replica_id: &str,
        position: usize,
        content: impl Into<String>,
    ) -> Operation {
        self.clock.increment(replica_id);
        Operation::insert(replica_id, self.clock.clone(), position, content, Utc::now())
    }

    /// Create a single-character delete originating at `replica_id`.
    pub fn create_delete(&mut self, replica_id: &str, position: usize) -> Operation {
        self.clock.increment(replica_id);
        Operation::delete(replica_id, self.clock.clone(), position, Utc::now())
    }

    /// Create `len` single-character deletes that together remove the range
    /// starting at `position`.
    pub fn create_delete_range(
        &mut self,
        replica_id: &str,
        position: usize,
        len: usize,
    ) -> Vec<Operation> {
        (0..len)
            .map(|_| self.create_delete(replica_id, position))
            .collect()
    }

    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, CrdtError> {
        serde_json::to_string(self).map_err(|e| CrdtError::Serialize(e.to_string()))
    }

    /// Deserialize from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns error if the input is not a valid replicated text.
    pub fn from_json(json: &str) -> Result<Self, CrdtError> {
        serde_json::from_str(json).map_err(|e| CrdtError::Deserialize(e.to_string()))
    }

    /// Re-derive the cached text from the operation log.
    ///
    /// Decoding trusts a cached text if one is present; call this on state
    /// received from an untrusted peer.
    pub fn rebuild(&mut self) {
        self.text = merge::materialize(&self.operations);
    }
}

/// Errors for replicated text serialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CrdtError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
