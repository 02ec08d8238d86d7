//! Note model wrapping a replicated text.
//!
//! A note carries its own vector clock next to the replicated text's clock.
//! Reconciliation compares note clocks; the text clock only tracks which
//! operations have been applied.

use crate::clock::VectorClock;
use crate::crdt::{Operation, TextCrdt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a note.
pub type NoteId = String;

/// A shared plain-text note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Note identifier
    pub id: NoteId,
    /// Human-readable title
    #[serde(default)]
    pub title: String,
    /// Plain-text projection of `crdt`
    #[serde(default)]
    pub content: String,
    /// Replicated text state
    #[serde(default)]
    pub crdt: TextCrdt,
    /// Note-level causality clock
    #[serde(default)]
    pub clock: VectorClock,
    /// Creation time
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last modification time
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Note {
    /// Create an empty note.
    #[must_use]
    pub fn new(id: impl Into<NoteId>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            crdt: TextCrdt::new(),
            clock: VectorClock::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Create a note authored by `replica_id`, seeding the text with
    /// `content` as a single insert.
    #[must_use]
    pub fn authored(
        id: impl Into<NoteId>,
        title: impl Into<String>,
        content: &str,
        replica_id: &str,
    ) -> Self {
        let mut note = Self::new(id, title);
        note.clock.increment(replica_id);

        if !content.is_empty() {
            let op = note.crdt.create_insert(replica_id, 0, content);
            note.crdt.apply(op);
        }
        note.refresh_content();

        tracing::debug!(
            note_id = %note.id,
            replica_id,
            clock = %note.clock,
            "Created note"
        );
        note
    }

    /// Re-derive `content` from the replicated text.
    pub fn refresh_content(&mut self) {
        self.content = self.crdt.text().to_string();
    }

    /// Merge another replica's state of this note into this one.
    ///
    /// Unions the operation logs, absorbs the other clock, re-derives the
    /// content and bumps `updated_at`. Returns the operations that were
    /// new to this note.
    pub fn absorb(&mut self, other: &Self) -> Vec<Operation> {
        let added = self.crdt.merge(&other.crdt);
        self.clock.merge(&other.clock);
        self.refresh_content();
        self.updated_at = Utc::now();
        added
    }

    /// Check whether the note has been soft-deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
