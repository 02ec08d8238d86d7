//! # notesync Server
//!
//! Sync backend for a multi-device notes application.
//!
//! Clients connect over WebSocket, push live edits that are applied and
//! echoed to every connected replica, and periodically send their whole
//! local state for causal reconciliation.

use anyhow::Result;
use notesync_server::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting notesync server"
    );

    // Load configuration
    let config = ServerConfig::from_env()?;

    let server = Server::new(config)?;

    server.run().await?;

    Ok(())
}
