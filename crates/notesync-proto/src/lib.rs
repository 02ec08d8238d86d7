//! # notesync Protocol
//!
//! Message definitions for the live edit channel and batch sync.
//!
//! ## Messages
//!
//! - `edit`: a single live operation against one note
//! - `sync`: a batch reconciliation request carrying local notes and
//!   the last clock seen per note
//! - `sync_response`: notes to adopt, conflict records, resulting clocks
//!
//! Every message travels in a `{type, payload}` envelope, as JSON in text
//! frames or CBOR in binary frames.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;

pub use messages::{
    ChannelMessage, Conflict, EditPayload, MessageError, Resolution, SyncRequest, SyncResponse,
    WireFormat,
};
