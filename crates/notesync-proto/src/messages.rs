//! Protocol messages for live edits and batch sync.

use notesync_core::{Note, NoteId, Operation, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A message on the live channel.
///
/// Encoded as `{"type": "...", "payload": {...}}`. Decoding into this enum
/// is the only dispatch point; unknown types fail to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelMessage {
    /// A single live operation
    Edit(EditPayload),
    /// A batch reconciliation request
    Sync(SyncRequest),
    /// The answer to a [`ChannelMessage::Sync`]
    SyncResponse(SyncResponse),
}

impl ChannelMessage {
    /// Short name of the message type, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::Edit(_) => "edit",
            ChannelMessage::Sync(_) => "sync",
            ChannelMessage::SyncResponse(_) => "sync_response",
        }
    }

    /// Serialize to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(|e| MessageError::Deserialize(e.to_string()))
    }

    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| MessageError::Serialize(e.to_string()))?;
        Ok(bytes)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
    }
}

/// Payload of an `edit` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPayload {
    /// Target note
    #[serde(alias = "note_id")]
    pub document_id: NoteId,
    /// Replica that issued the edit
    #[serde(alias = "client_id")]
    pub replica_id: String,
    /// The operation itself
    pub operation: Operation,
}

/// Batch reconciliation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Requesting replica
    #[serde(alias = "client_id")]
    pub replica_id: String,
    /// Notes held locally by the requester
    #[serde(default, alias = "notes")]
    pub documents: Vec<Note>,
    /// Last clock the requester has seen, per note
    #[serde(default)]
    pub last_sync: BTreeMap<NoteId, VectorClock>,
}

impl SyncRequest {
    /// Create an empty request for a replica.
    #[must_use]
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self {
            replica_id: replica_id.into(),
            documents: Vec::new(),
            last_sync: BTreeMap::new(),
        }
    }
}

/// Batch reconciliation response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Notes the requester should adopt
    #[serde(default, alias = "notes")]
    pub documents: Vec<Note>,
    /// Conflicts detected while reconciling
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// Resulting clock per returned note
    #[serde(default)]
    pub clock: BTreeMap<NoteId, VectorClock>,
}

/// How a detected conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Both sides' operations were merged
    Merged,
}

/// A record of concurrent edits that were merged during reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Affected note
    #[serde(alias = "note_id")]
    pub document_id: NoteId,
    /// Clock submitted by the client
    pub client_clock: VectorClock,
    /// Server clock after the merge
    pub server_clock: VectorClock,
    /// Resolution applied
    pub resolution: Resolution,
}

impl Conflict {
    /// Create a record for a merged conflict.
    #[must_use]
    pub fn merged(
        document_id: impl Into<NoteId>,
        client_clock: VectorClock,
        server_clock: VectorClock,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            client_clock,
            server_clock,
            resolution: Resolution::Merged,
        }
    }
}

/// Frame encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON in text frames
    #[default]
    Json,
    /// CBOR in binary frames
    Cbor,
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
