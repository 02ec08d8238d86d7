//! Server configuration.

use anyhow::{bail, Context, Result};
use notesync_proto::WireFormat;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Live edit distribution configuration
    pub broadcast: BroadcastConfig,

    /// Per-connection configuration
    pub connection: ConnectionConfig,

    /// Sync engine configuration
    pub engine: EngineConfig,
}

/// Which note store backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    /// `SQLite` database at [`PersistenceConfig::db_path`]
    Sqlite,
    /// Process memory; lost on exit
    Memory,
}

impl FromStr for StoreType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown store type {other:?}, expected \"sqlite\" or \"memory\""),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Store backend
    pub store_type: StoreType,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

/// Live edit distribution configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Capacity of the shared distribution queue
    pub distribution_capacity: usize,

    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,
}

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Disconnect a connection that sends nothing for this long
    pub idle_timeout: Option<Duration>,

    /// Encoding for distributed edits when the client did not pick one
    pub wire_format: WireFormat,
}

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Skip live edits whose operation ID is already applied
    pub dedupe_live_edits: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            persistence: PersistenceConfig {
                store_type: StoreType::Sqlite,
                db_path: PathBuf::from("./notes.db"),
            },
            broadcast: BroadcastConfig {
                distribution_capacity: 256,
                outbound_capacity: 256,
            },
            connection: ConnectionConfig {
                idle_timeout: None,
                wire_format: WireFormat::Json,
            },
            engine: EngineConfig {
                dedupe_live_edits: true,
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `NOTESYNC_BIND_ADDR`: listen address
    /// - `NOTESYNC_STORE_TYPE`: "sqlite" or "memory"
    /// - `NOTESYNC_DB_PATH`: SQLite database path
    /// - `NOTESYNC_DISTRIBUTION_CAPACITY`: shared queue capacity
    /// - `NOTESYNC_OUTBOUND_CAPACITY`: per-connection queue capacity
    /// - `NOTESYNC_IDLE_TIMEOUT_SECS`: idle disconnect, unset or 0 for none
    /// - `NOTESYNC_DEDUPE_LIVE_EDITS`: "true" or "false"
    /// - `NOTESYNC_WIRE_FORMAT`: "json" or "cbor"
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("NOTESYNC_BIND_ADDR") {
            config.bind_addr = addr;
        }

        if let Some(store_type) = parse_var(&lookup, "NOTESYNC_STORE_TYPE")? {
            config.persistence.store_type = store_type;
        }

        if let Some(db_path) = lookup("NOTESYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(capacity) = parse_var(&lookup, "NOTESYNC_DISTRIBUTION_CAPACITY")? {
            config.broadcast.distribution_capacity = capacity;
        }

        if let Some(capacity) = parse_var(&lookup, "NOTESYNC_OUTBOUND_CAPACITY")? {
            config.broadcast.outbound_capacity = capacity;
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "NOTESYNC_IDLE_TIMEOUT_SECS")? {
            config.connection.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(dedupe) = parse_var(&lookup, "NOTESYNC_DEDUPE_LIVE_EDITS")? {
            config.engine.dedupe_live_edits = dedupe;
        }

        if let Some(format) = lookup("NOTESYNC_WIRE_FORMAT") {
            config.connection.wire_format =
                parse_wire_format(&format).context("Invalid NOTESYNC_WIRE_FORMAT")?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.broadcast.distribution_capacity == 0 {
            bail!("NOTESYNC_DISTRIBUTION_CAPACITY must be at least 1");
        }
        if self.broadcast.outbound_capacity == 0 {
            bail!("NOTESYNC_OUTBOUND_CAPACITY must be at least 1");
        }
        Ok(())
    }
}

/// Parse a wire format name ("json" or "cbor").
///
/// # Errors
///
/// Returns error for any other name.
pub fn parse_wire_format(name: &str) -> Result<WireFormat> {
    match name.trim().to_ascii_lowercase().as_str() {
        "json" => Ok(WireFormat::Json),
        "cbor" => Ok(WireFormat::Cbor),
        other => bail!("unknown wire format {other:?}, expected \"json\" or \"cbor\""),
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("Invalid {name}"))
        })
        .transpose()
}
