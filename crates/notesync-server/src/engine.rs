//! Synchronization engine.
//!
//! Reconciles client-submitted note state against the stored state and
//! applies live edits. Every load-modify-save cycle runs inside a
//! per-note exclusive section so concurrent edits to one note cannot
//! overwrite each other, while edits to different notes proceed in
//! parallel.

use crate::persistence::{NoteStore, StoreError};
use chrono::{DateTime, Utc};
use notesync_core::{ClockOrdering, Note, NoteId, Operation, VectorClock};
use notesync_proto::{Conflict, SyncRequest, SyncResponse};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// What reconciliation did with an incoming note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The note was unknown and has been stored as submitted
    Created,
    /// The incoming state was causally behind and was dropped
    Discarded,
    /// The incoming state was strictly ahead and was merged in
    CaughtUp,
    /// The states were concurrent (or equal) and were merged
    Merged,
}

/// Result of reconciling one note.
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// The authoritative note after reconciliation
    pub note: Note,
    /// Conflict record, only for [`ReconcileOutcome::Merged`]
    pub conflict: Option<Conflict>,
    /// Which branch was taken
    pub outcome: ReconcileOutcome,
}

/// Per-note exclusive sections.
///
/// Entries are created on demand and dropped again once no caller holds
/// or waits for them.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<NoteId, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    fn with_document<T>(&self, id: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };

        let result = {
            // The guarded value is (), so a poisoned lock carries no bad state
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry plus ours: nobody else is holding or waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(id);
        }

        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Reconciles and applies edits against a [`NoteStore`].
pub struct SyncEngine {
    store: Arc<dyn NoteStore>,
    locks: DocumentLocks,
    dedupe_live_edits: bool,
}

impl SyncEngine {
    /// Create an engine over a store. Live edits are deduplicated by ID.
    #[must_use]
    pub fn new(store: Arc<dyn NoteStore>) -> Self {
        Self {
            store,
            locks: DocumentLocks::default(),
            dedupe_live_edits: true,
        }
    }

    /// Choose whether live edits whose ID is already in the log are skipped
    /// (`true`) or appended again (`false`).
    #[must_use]
    pub fn with_live_edit_dedup(mut self, enabled: bool) -> Self {
        self.dedupe_live_edits = enabled;
        self
    }

    /// Reconcile one client-submitted note against the stored one.
    ///
    /// `last_sync` is the last clock the client saw for this note; it does
    /// not influence the decision and is only logged.
    ///
    /// # Errors
    ///
    /// Returns error if the note has no ID or storage fails.
    pub fn reconcile(
        &self,
        incoming: Note,
        last_sync: Option<&VectorClock>,
    ) -> Result<Reconciled, EngineError> {
        if incoming.id.is_empty() {
            return Err(EngineError::InvalidNote("note id is empty".to_string()));
        }

        let id = incoming.id.clone();
        self.locks
            .with_document(&id, || self.reconcile_locked(incoming, last_sync))
    }

    fn reconcile_locked(
        &self,
        mut incoming: Note,
        last_sync: Option<&VectorClock>,
    ) -> Result<Reconciled, EngineError> {
        let Some(mut stored) = self.store.get(&incoming.id)? else {
            // The client's cached text is not trusted
            incoming.crdt.rebuild();
            incoming.refresh_content();
            incoming.updated_at = Utc::now();
            self.store.save(&incoming)?;
            self.log_operations(&incoming.id, incoming.crdt.operations())?;
            tracing::info!(note_id = %incoming.id, "Stored new note from client");
            return Ok(Reconciled {
                note: incoming,
                conflict: None,
                outcome: ReconcileOutcome::Created,
            });
        };

        let ordering = incoming.clock.compare(&stored.clock);
        tracing::debug!(
            note_id = %stored.id,
            client_clock = %incoming.clock,
            server_clock = %stored.clock,
            last_sync = ?last_sync.map(ToString::to_string),
            ?ordering,
            "Reconciling note"
        );

        match ordering {
            ClockOrdering::Before => {
                tracing::info!(note_id = %stored.id, "Client behind, server wins");
                Ok(Reconciled {
                    note: stored,
                    conflict: None,
                    outcome: ReconcileOutcome::Discarded,
                })
            }
            ClockOrdering::After => {
                let added = stored.absorb(&incoming);
                self.store.save(&stored)?;
                self.log_operations(&stored.id, &added)?;
                tracing::info!(
                    note_id = %stored.id,
                    added = added.len(),
                    "Server behind, caught up from client"
                );
                Ok(Reconciled {
                    note: stored,
                    conflict: None,
                    outcome: ReconcileOutcome::CaughtUp,
                })
            }
            ClockOrdering::Concurrent => {
                let added = stored.absorb(&incoming);
                self.store.save(&stored)?;
                self.log_operations(&stored.id, &added)?;
                tracing::info!(note_id = %stored.id, added = added.len(), "Concurrent edits merged");
                let conflict = Conflict::merged(
                    stored.id.clone(),
                    incoming.clock,
                    stored.clock.clone(),
                );
                Ok(Reconciled {
                    note: stored,
                    conflict: Some(conflict),
                    outcome: ReconcileOutcome::Merged,
                })
            }
        }
    }

    fn log_operations(&self, note_id: &str, ops: &[Operation]) -> Result<(), StoreError> {
        for op in ops {
            self.store.save_operation(note_id, op)?;
        }
        Ok(())
    }

    /// Process a batch sync request.
    ///
    /// Each submitted note is reconciled; a note that fails is logged and
    /// skipped. The response then carries every stored note the client has
    /// never seen or whose clock is strictly after the client's last-seen
    /// clock for it.
    ///
    /// # Errors
    ///
    /// Returns error if the stored notes cannot be listed.
    pub fn sync(&self, request: &SyncRequest) -> Result<SyncResponse, EngineError> {
        let mut response = SyncResponse::default();

        for note in &request.documents {
            let last_sync = request.last_sync.get(&note.id);
            match self.reconcile(note.clone(), last_sync) {
                Ok(reconciled) => response.conflicts.extend(reconciled.conflict),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        note_id = %note.id,
                        replica_id = %request.replica_id,
                        "Failed to reconcile note"
                    );
                }
            }
        }

        for note in self.store.get_all()? {
            let include = request
                .last_sync
                .get(&note.id)
                .map_or(true, |seen| note.clock.compare(seen) == ClockOrdering::After);
            if include {
                response.clock.insert(note.id.clone(), note.clock.clone());
                response.documents.push(note);
            }
        }

        tracing::debug!(
            replica_id = %request.replica_id,
            submitted = request.documents.len(),
            returned = response.documents.len(),
            conflicts = response.conflicts.len(),
            "Sync complete"
        );
        Ok(response)
    }

    /// Apply a single live operation to a note.
    ///
    /// Returns the accepted operation for distribution, or `None` when
    /// deduplication is on and the operation was already in the log.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the note does not exist, or a
    /// storage error.
    pub fn apply_live_edit(
        &self,
        note_id: &str,
        op: Operation,
    ) -> Result<Option<Operation>, EngineError> {
        self.locks.with_document(note_id, || {
            let mut note = self
                .store
                .get(note_id)?
                .ok_or_else(|| EngineError::NotFound(note_id.to_string()))?;

            if self.dedupe_live_edits && note.crdt.contains(&op.id) {
                tracing::debug!(note_id, op_id = %op.id, "Skipping already applied operation");
                return Ok(None);
            }

            note.crdt.apply(op.clone());
            note.clock.merge(&op.clock);
            note.refresh_content();
            note.updated_at = Utc::now();

            self.store.save(&note)?;
            self.store.save_operation(note_id, &op)?;

            tracing::debug!(
                note_id,
                op_id = %op.id,
                replica_id = %op.replica_id,
                "Applied live edit"
            );
            Ok(Some(op))
        })
    }

    /// Create a note authored by `replica_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyExists`] if the ID is taken, or a
    /// storage error.
    pub fn create_note(
        &self,
        id: impl Into<NoteId>,
        title: &str,
        content: &str,
        replica_id: &str,
    ) -> Result<Note, EngineError> {
        let id = id.into();
        self.locks.with_document(&id, || {
            if self.store.get(&id)?.is_some() {
                return Err(EngineError::AlreadyExists(id.clone()));
            }

            let note = Note::authored(id.clone(), title, content, replica_id);
            self.store.save(&note)?;
            self.log_operations(&note.id, note.crdt.operations())?;
            tracing::info!(note_id = %note.id, replica_id, "Created note");
            Ok(note)
        })
    }

    /// Load a note, including soft-deleted ones.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn get_note(&self, id: &str) -> Result<Option<Note>, EngineError> {
        Ok(self.store.get(id)?)
    }

    /// List non-deleted notes, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn list_notes(&self) -> Result<Vec<Note>, EngineError> {
        Ok(self.store.get_all()?)
    }

    /// Soft-delete a note.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the note does not exist, or a
    /// storage error.
    pub fn delete_note(&self, id: &str) -> Result<(), EngineError> {
        self.locks.with_document(id, || {
            if self.store.soft_delete(id)? {
                tracing::info!(note_id = id, "Deleted note");
                Ok(())
            } else {
                Err(EngineError::NotFound(id.to_string()))
            }
        })
    }

    /// Notes updated strictly after `since`, deleted ones included, most
    /// recently updated first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn notes_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Note>, EngineError> {
        Ok(self.store.modified_since(since)?)
    }

    /// Logged operations for a note that `since` has not seen.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn operations_since(
        &self,
        note_id: &str,
        since: Option<&VectorClock>,
    ) -> Result<Vec<Operation>, EngineError> {
        Ok(self.store.operations_for(note_id, since)?)
    }
}

/// Errors from the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The target note does not exist
    #[error("note not found: {0}")]
    NotFound(NoteId),
    /// A note with this ID already exists
    #[error("note already exists: {0}")]
    AlreadyExists(NoteId),
    /// The submitted note is unusable
    #[error("invalid note: {0}")]
    InvalidNote(String),
    /// Storage failed
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use notesync_core::TextCrdt;
    use std::thread;

    fn engine() -> SyncEngine {
        SyncEngine::new(Arc::new(MemoryStore::new()))
    }

    /// Server holds "AB" with clock {c1:1}; returns that note.
    fn seed(engine: &SyncEngine) -> Note {
        engine.create_note("n1", "Scenario", "AB", "c1").unwrap()
    }

    #[test]
    fn reconcile_unknown_note_stores_it() {
        let engine = engine();
        let note = Note::authored("fresh", "New", "hello", "c1");

        let result = engine.reconcile(note, None).unwrap();

        assert_eq!(result.outcome, ReconcileOutcome::Created);
        assert!(result.conflict.is_none());
        assert_eq!(engine.get_note("fresh").unwrap().unwrap().content, "hello");
        assert_eq!(engine.operations_since("fresh", None).unwrap().len(), 1);
    }

    #[test]
    fn reconcile_new_note_rebuilds_submitted_text() {
        let engine = engine();
        let note = Note::authored("fresh", "New", "hello", "c1");
        let json = serde_json::to_string(&note)
            .unwrap()
            .replace(r#""text":"hello""#, r#""text":"forged""#);
        let mut forged: Note = serde_json::from_str(&json).unwrap();
        forged.content = "forged".to_string();
        assert_eq!(forged.crdt.text(), "forged");

        let result = engine.reconcile(forged, None).unwrap();

        assert_eq!(result.note.content, "hello");
        let stored = engine.get_note("fresh").unwrap().unwrap();
        assert_eq!(stored.content, "hello");
        assert_eq!(stored.crdt.text(), "hello");
    }

    #[test]
    fn reconcile_equal_clock_reports_conflict() {
        let engine = engine();
        let same = seed(&engine);

        let result = engine.reconcile(same.clone(), None).unwrap();

        assert_eq!(result.outcome, ReconcileOutcome::Merged);
        let conflict = result.conflict.unwrap();
        assert_eq!(conflict.document_id, "n1");
        assert_eq!(conflict.resolution, notesync_proto::Resolution::Merged);
        assert_eq!(result.note.content, "AB");
        assert_eq!(result.note.crdt.operations().len(), 1);

        let mut request = SyncRequest::new("c1");
        request.documents.push(same);
        assert_eq!(engine.sync(&request).unwrap().conflicts.len(), 1);
    }

    #[test]
    fn reconcile_rejects_empty_id() {
        let engine = engine();
        let note = Note::new("", "Nameless");

        assert!(matches!(
            engine.reconcile(note, None),
            Err(EngineError::InvalidNote(_))
        ));
    }

    #[test]
    fn reconcile_discards_causally_older_state() {
        let engine = engine();
        let stale = seed(&engine);

        // Server moves ahead with a live edit
        let mut server_view = engine.get_note("n1").unwrap().unwrap();
        let op = server_view.crdt.create_insert("c1", 2, "C");
        engine.apply_live_edit("n1", op).unwrap();
        let before = engine.get_note("n1").unwrap().unwrap();
        assert_eq!(before.content, "ABC");

        let result = engine.reconcile(stale, None).unwrap();

        assert_eq!(result.outcome, ReconcileOutcome::Discarded);
        assert!(result.conflict.is_none());
        let after = engine.get_note("n1").unwrap().unwrap();
        assert_eq!(after.content, "ABC");
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[test]
    fn reconcile_catches_up_without_conflict() {
        let engine = engine();
        let mut client = seed(&engine);

        client.clock.increment("c1");
        let op = client.crdt.create_insert("c1", 2, "!");
        client.crdt.apply(op);
        client.refresh_content();

        let result = engine.reconcile(client, None).unwrap();

        assert_eq!(result.outcome, ReconcileOutcome::CaughtUp);
        assert!(result.conflict.is_none());
        assert_eq!(result.note.content, "AB!");
        assert_eq!(engine.get_note("n1").unwrap().unwrap().content, "AB!");
    }

    #[test]
    fn reconciled_client_edits_reach_operation_log() {
        let engine = engine();
        let mut client = seed(&engine);
        let checkpoint = client.crdt.clock().clone();

        // Offline insert from a second replica
        client.clock.increment("c2");
        let op = client.crdt.create_insert("c2", 1, "-");
        client.crdt.apply(op.clone());
        client.refresh_content();

        let result = engine.reconcile(client.clone(), None).unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::CaughtUp);

        let newer = engine.operations_since("n1", Some(&checkpoint)).unwrap();
        assert_eq!(newer, vec![op]);

        // Reconciling the same state again logs nothing new
        engine.reconcile(client, None).unwrap();
        assert_eq!(engine.operations_since("n1", None).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_scenario_converges_with_one_conflict() {
        let engine = engine();
        let base = seed(&engine);

        // Replica 1 inserts X at 1 and pushes it live
        let mut replica1 = base.clone();
        let op_x = replica1.crdt.create_insert("c1", 1, "X");
        replica1.crdt.apply(op_x.clone());
        replica1.clock.merge(&op_x.clock);
        replica1.refresh_content();
        assert_eq!(replica1.content, "AXB");
        engine.apply_live_edit("n1", op_x).unwrap();

        // Replica 2 edited offline: Y at 1 with its own increment
        let mut replica2 = base.clone();
        let op_y = replica2.crdt.create_insert("c2", 1, "Y");
        replica2.crdt.apply(op_y.clone());
        replica2.clock.merge(&op_y.clock);
        replica2.refresh_content();
        assert_eq!(replica2.content, "AYB");

        let mut request = SyncRequest::new("c2");
        request.documents.push(replica2.clone());
        request.last_sync.insert("n1".to_string(), base.clock.clone());

        let response = engine.sync(&request).unwrap();

        assert_eq!(response.conflicts.len(), 1);
        let conflict = &response.conflicts[0];
        assert_eq!(conflict.document_id, "n1");
        assert_eq!(conflict.resolution, notesync_proto::Resolution::Merged);

        let server = engine.get_note("n1").unwrap().unwrap();
        assert!(server.content == "AXYB" || server.content == "AYXB");

        let logged = engine.operations_since("n1", None).unwrap();
        assert_eq!(logged.len(), 3);
        assert!(logged.iter().any(|op| op.id == op_y.id));

        // Replica 1 merges the server state and converges
        replica1.absorb(&server);
        replica2.absorb(&server);
        assert_eq!(replica1.content, server.content);
        assert_eq!(replica2.content, server.content);
    }

    #[test]
    fn sync_filters_by_strictly_newer_clock() {
        let engine = engine();
        let seen = engine.create_note("seen", "Seen", "a", "c1").unwrap();
        let unseen = engine.create_note("unseen", "Unseen", "b", "c1").unwrap();
        let newer = engine.create_note("newer", "Newer", "c", "c1").unwrap();
        let diverged = engine.create_note("diverged", "Diverged", "d", "c1").unwrap();

        let mut request = SyncRequest::new("c2");
        request.last_sync.insert(seen.id.clone(), seen.clock.clone());
        request.last_sync.insert(newer.id.clone(), VectorClock::new());
        let concurrent: VectorClock = [("c2", 1)].into_iter().collect();
        request.last_sync.insert(diverged.id.clone(), concurrent);

        let response = engine.sync(&request).unwrap();
        let mut ids: Vec<&str> = response.documents.iter().map(|n| n.id.as_str()).collect();
        ids.sort_unstable();

        assert_eq!(ids, vec!["newer", unseen.id.as_str()]);
        assert_eq!(response.clock.len(), 2);
        assert!(response.conflicts.is_empty());
    }

    #[test]
    fn sync_skips_failing_notes() {
        let engine = engine();
        let mut request = SyncRequest::new("c1");
        request.documents.push(Note::new("", "Broken"));
        request.documents.push(Note::authored("ok", "Fine", "x", "c1"));

        let response = engine.sync(&request).unwrap();

        assert_eq!(response.documents.len(), 1);
        assert_eq!(response.documents[0].id, "ok");
    }

    #[test]
    fn live_edit_on_missing_note_is_not_found() {
        let engine = engine();
        let mut crdt = TextCrdt::new();
        let op = crdt.create_insert("c1", 0, "x");

        assert!(matches!(
            engine.apply_live_edit("ghost", op),
            Err(EngineError::NotFound(id)) if id == "ghost"
        ));
    }

    #[test]
    fn live_edit_dedup_is_configurable() {
        let engine = engine();
        let note = seed(&engine);
        let mut crdt = note.crdt.clone();
        let op = crdt.create_insert("c1", 2, "C");

        assert!(engine.apply_live_edit("n1", op.clone()).unwrap().is_some());
        assert!(engine.apply_live_edit("n1", op.clone()).unwrap().is_none());
        assert_eq!(engine.get_note("n1").unwrap().unwrap().content, "ABC");

        let raw = SyncEngine::new(Arc::new(MemoryStore::new())).with_live_edit_dedup(false);
        raw.create_note("n1", "Raw", "AB", "c1").unwrap();
        raw.apply_live_edit("n1", op.clone()).unwrap();
        raw.apply_live_edit("n1", op).unwrap();
        let stored = raw.get_note("n1").unwrap().unwrap();
        assert_eq!(stored.crdt.operations().len(), 3);
        assert_eq!(stored.content, "ABCC");
    }

    #[test]
    fn live_edits_are_logged() {
        let engine = engine();
        let note = seed(&engine);
        let mut crdt = note.crdt.clone();
        let checkpoint = crdt.clock().clone();
        let op = crdt.create_insert("c1", 0, ">");
        engine.apply_live_edit("n1", op.clone()).unwrap();

        let all = engine.operations_since("n1", None).unwrap();
        assert_eq!(all.len(), 2);
        let newer = engine.operations_since("n1", Some(&checkpoint)).unwrap();
        assert_eq!(newer, vec![op]);
    }

    #[test]
    fn notes_modified_since_includes_deleted() {
        let engine = engine();
        let before = Utc::now() - chrono::Duration::seconds(1);
        engine.create_note("kept", "Kept", "a", "c1").unwrap();
        engine.create_note("gone", "Gone", "b", "c1").unwrap();
        engine.delete_note("gone").unwrap();

        let mut ids: Vec<String> = engine
            .notes_modified_since(before)
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["gone", "kept"]);

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(engine.notes_modified_since(later).unwrap().is_empty());
    }

    #[test]
    fn create_and_delete_lifecycle() {
        let engine = engine();
        engine.create_note("n1", "T", "x", "c1").unwrap();

        assert!(matches!(
            engine.create_note("n1", "T", "y", "c1"),
            Err(EngineError::AlreadyExists(_))
        ));

        engine.delete_note("n1").unwrap();
        assert!(engine.list_notes().unwrap().is_empty());
        assert!(engine.get_note("n1").unwrap().unwrap().is_deleted());
        assert!(matches!(
            engine.delete_note("ghost"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_live_edits_are_not_lost() {
        let engine = Arc::new(engine());
        seed(&engine);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    let replica = format!("r{i}");
                    let mut crdt = TextCrdt::new();
                    for _ in 0..10 {
                        let op = crdt.create_insert(&replica, 0, "z");
                        engine.apply_live_edit("n1", op).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let note = engine.get_note("n1").unwrap().unwrap();
        assert_eq!(note.crdt.operations().len(), 1 + 8 * 10);
        assert_eq!(note.content.chars().count(), 2 + 8 * 10);
        assert_eq!(engine.locks.len(), 0);
    }
}
