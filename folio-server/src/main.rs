//! Folio history server.
//!
//! Configuration comes from the environment:
//!
//! | Variable          | Default          |
//! |-------------------|------------------|
//! | `FOLIO_BIND_ADDR` | `127.0.0.1:9090` |
//! | `FOLIO_DATA_DIR`  | in-memory        |
//! | `FOLIO_ROOT_TEXT` | `default`        |
//!
//! `RUST_LOG` controls log verbosity.

use std::env;
use std::path::PathBuf;

use folio_history::{HistoryServer, ServerConfig};
use log::info;

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = env::var("FOLIO_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(dir) = env::var("FOLIO_DATA_DIR") {
        if !dir.trim().is_empty() {
            config.storage_path = Some(PathBuf::from(dir));
        }
    }
    if let Ok(root) = env::var("FOLIO_ROOT_TEXT") {
        if !root.trim().is_empty() {
            config.root_name = root;
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = config_from_env();
    match &config.storage_path {
        Some(path) => info!("Starting Folio server with storage at {}", path.display()),
        None => info!("Starting Folio server (in-memory, nothing is persisted)"),
    }

    let server = HistoryServer::new(config)?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
    server.shutdown().await;
    Ok(())
}
