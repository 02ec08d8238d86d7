//! Note and operation-log persistence.
//!
//! The engine talks to storage through [`NoteStore`]. Each call is atomic
//! on its own; composing load-modify-save into one unit is the engine's
//! job (see `engine::DocumentLocks`).

use chrono::{DateTime, Utc};
use notesync_core::{Note, NoteId, Operation, TextCrdt, VectorClock};
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

/// Storage contract consumed by the sync engine.
pub trait NoteStore: Send + Sync {
    /// Insert or replace a note.
    ///
    /// # Errors
    ///
    /// Returns error if the note cannot be written.
    fn save(&self, note: &Note) -> Result<(), StoreError>;

    /// Load a note by ID, deleted or not.
    ///
    /// # Errors
    ///
    /// Returns error if the note cannot be read.
    fn get(&self, id: &str) -> Result<Option<Note>, StoreError>;

    /// Load all non-deleted notes, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns error if the notes cannot be read.
    fn get_all(&self) -> Result<Vec<Note>, StoreError>;

    /// Load every note updated strictly after `since`, deleted ones
    /// included, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns error if the notes cannot be read.
    fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Note>, StoreError>;

    /// Mark a note deleted. Returns `false` if no such note exists.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    fn soft_delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Append an operation to a note's log. Re-saving an ID is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    fn save_operation(&self, note_id: &str, op: &Operation) -> Result<(), StoreError>;

    /// Logged operations for a note ordered by timestamp, optionally only
    /// those not causally covered by `since`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    fn operations_for(
        &self,
        note_id: &str,
        since: Option<&VectorClock>,
    ) -> Result<Vec<Operation>, StoreError>;
}

/// `SQLite`-backed note store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Initialize database schema.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS notes (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            crdt_data TEXT NOT NULL,
            clock_data TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_notes_updated_at ON notes(updated_at);
        CREATE INDEX IF NOT EXISTS idx_notes_deleted_at ON notes(deleted_at);

        -- Operation log; IDs are only unique within a note
        CREATE TABLE IF NOT EXISTS operations (
            note_id TEXT NOT NULL,
            id TEXT NOT NULL,
            replica_id TEXT NOT NULL,
            operation_data TEXT NOT NULL,
            clock_data TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            PRIMARY KEY (note_id, id),
            FOREIGN KEY (note_id) REFERENCES notes(id)
        );

        CREATE INDEX IF NOT EXISTS idx_operations_timestamp ON operations(timestamp);
        ",
    )
}

const NOTE_COLUMNS: &str =
    "id, title, content, crdt_data, clock_data, created_at, updated_at, deleted_at";

fn note_from_row(row: &Row<'_>) -> Result<Note, StoreError> {
    let crdt_data: String = row.get(3)?;
    let clock_data: String = row.get(4)?;

    Ok(Note {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        crdt: serde_json::from_str::<TextCrdt>(&crdt_data)?,
        clock: serde_json::from_str::<VectorClock>(&clock_data)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

impl NoteStore for SqliteStore {
    fn save(&self, note: &Note) -> Result<(), StoreError> {
        let crdt_data = serde_json::to_string(&note.crdt)?;
        let clock_data = serde_json::to_string(&note.clock)?;

        self.conn()?.execute(
            r"
            INSERT INTO notes (id, title, content, crdt_data, clock_data, created_at, updated_at, deleted_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                crdt_data = excluded.crdt_data,
                clock_data = excluded.clock_data,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at
            ",
            (
                &note.id,
                &note.title,
                &note.content,
                crdt_data,
                clock_data,
                note.created_at,
                note.updated_at,
                note.deleted_at,
            ),
        )?;

        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Note>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"))?;

        let note = stmt
            .query_row([id], |row| Ok(note_from_row(row)))
            .optional()?;
        note.transpose()
    }

    fn get_all(&self) -> Result<Vec<Note>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTE_COLUMNS} FROM notes WHERE deleted_at IS NULL ORDER BY updated_at DESC"
        ))?;

        let mut rows = stmt.query([])?;
        let mut notes = Vec::new();
        while let Some(row) = rows.next()? {
            notes.push(note_from_row(row)?);
        }

        Ok(notes)
    }

    fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Note>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTE_COLUMNS} FROM notes WHERE updated_at > ?1 ORDER BY updated_at DESC"
        ))?;

        let mut rows = stmt.query([since])?;
        let mut notes = Vec::new();
        while let Some(row) = rows.next()? {
            notes.push(note_from_row(row)?);
        }

        Ok(notes)
    }

    fn soft_delete(&self, id: &str) -> Result<bool, StoreError> {
        let updated = self.conn()?.execute(
            "UPDATE notes SET deleted_at = ?1 WHERE id = ?2",
            (Utc::now(), id),
        )?;

        Ok(updated > 0)
    }

    fn save_operation(&self, note_id: &str, op: &Operation) -> Result<(), StoreError> {
        let operation_data = serde_json::to_string(op)?;
        let clock_data = serde_json::to_string(&op.clock)?;

        self.conn()?.execute(
            r"
            INSERT INTO operations (note_id, id, replica_id, operation_data, clock_data, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(note_id, id) DO NOTHING
            ",
            (
                note_id,
                &op.id,
                &op.replica_id,
                operation_data,
                clock_data,
                op.timestamp,
            ),
        )?;

        Ok(())
    }

    fn operations_for(
        &self,
        note_id: &str,
        since: Option<&VectorClock>,
    ) -> Result<Vec<Operation>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
            SELECT operation_data FROM operations
            WHERE note_id = ?1
            ORDER BY timestamp ASC, rowid ASC
            ",
        )?;

        let mut rows = stmt.query([note_id])?;
        let mut operations = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(0)?;
            let op: Operation = serde_json::from_str(&data)?;
            if since.map_or(true, |since| !op.clock.dominated_by(since)) {
                operations.push(op);
            }
        }

        Ok(operations)
    }
}

/// In-memory note store, for tests and `memory` deployments.
#[derive(Default)]
pub struct MemoryStore {
    notes: RwLock<HashMap<NoteId, Note>>,
    operations: RwLock<HashMap<NoteId, Vec<Operation>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl NoteStore for MemoryStore {
    fn save(&self, note: &Note) -> Result<(), StoreError> {
        let mut notes = self.notes.write().map_err(|_| StoreError::Poisoned)?;
        notes.insert(note.id.clone(), note.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Note>, StoreError> {
        let notes = self.notes.read().map_err(|_| StoreError::Poisoned)?;
        Ok(notes.get(id).cloned())
    }

    fn get_all(&self) -> Result<Vec<Note>, StoreError> {
        let notes = self.notes.read().map_err(|_| StoreError::Poisoned)?;
        let mut live: Vec<Note> = notes.values().filter(|n| !n.is_deleted()).cloned().collect();
        live.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(live)
    }

    fn modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Note>, StoreError> {
        let notes = self.notes.read().map_err(|_| StoreError::Poisoned)?;
        let mut changed: Vec<Note> = notes
            .values()
            .filter(|n| n.updated_at > since)
            .cloned()
            .collect();
        changed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(changed)
    }

    fn soft_delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut notes = self.notes.write().map_err(|_| StoreError::Poisoned)?;
        Ok(notes.get_mut(id).map_or(false, |note| {
            note.deleted_at = Some(Utc::now());
            true
        }))
    }

    fn save_operation(&self, note_id: &str, op: &Operation) -> Result<(), StoreError> {
        let mut operations = self.operations.write().map_err(|_| StoreError::Poisoned)?;
        let log = operations.entry(note_id.to_string()).or_default();
        if !log.iter().any(|existing| existing.id == op.id) {
            log.push(op.clone());
        }
        Ok(())
    }

    fn operations_for(
        &self,
        note_id: &str,
        since: Option<&VectorClock>,
    ) -> Result<Vec<Operation>, StoreError> {
        let operations = self.operations.read().map_err(|_| StoreError::Poisoned)?;
        let mut ops: Vec<Operation> = operations
            .get(note_id)
            .into_iter()
            .flatten()
            .filter(|op| since.map_or(true, |since| !op.clock.dominated_by(since)))
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.timestamp);
        Ok(ops)
    }
}

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `SQLite` failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Stored JSON could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// A previous writer panicked while holding the store lock
    #[error("store lock poisoned")]
    Poisoned,
}
