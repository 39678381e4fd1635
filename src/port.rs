use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::Path;
use std::time::SystemTime;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// No local port at or above the requested base could be bound.
#[derive(Debug, Error)]
#[error("could not bind a local port starting at {base}")]
pub struct PortBindError {
    pub base: u16,
    #[source]
    pub source: std::io::Error,
}

/// Discovery record other local processes read to find the live port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRegistry {
    pub port: u16,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

/// Binds the first free loopback port at or above `base` and returns the
/// listener itself. The caller serves on this exact socket; probing a port
/// and rebinding it later would let another process steal it in between.
/// Only `AddrInUse` advances the scan, any other bind error is fatal.
pub async fn bind_first_free_port(base: u16) -> Result<(TcpListener, u16), PortBindError> {
    let mut port = base;
    loop {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let bound = listener
                    .local_addr()
                    .map_err(|err| PortBindError { base, source: err })?
                    .port();
                if port != base {
                    info!("port {base} was unavailable, bound {bound} instead");
                }
                return Ok((listener, bound));
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => match port.checked_add(1) {
                Some(next) => {
                    info!("port {port} is already in use, trying {next}");
                    port = next;
                }
                None => return Err(PortBindError { base, source: err }),
            },
            Err(err) => return Err(PortBindError { base, source: err }),
        }
    }
}

/// Overwrites the registry file with the bound port. Callers treat failure
/// as non-fatal: the server keeps serving even if discovery publication
/// does not work.
pub async fn write_port_registry(path: &Path, port: u16) -> anyhow::Result<()> {
    let registry = PortRegistry {
        port,
        updated_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
    };
    let data = serde_json::to_vec_pretty(&registry).context("failed to serialize port registry")?;
    tokio::fs::write(path, data)
        .await
        .with_context(|| format!("failed to write port registry {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn skips_an_occupied_base_port() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = occupied.local_addr().expect("local_addr").port();

        let (listener, port) = bind_first_free_port(base).await.expect("allocate");
        assert!(port > base, "expected a port above {base}, got {port}");
        assert_eq!(listener.local_addr().expect("local_addr").port(), port);
    }

    #[tokio::test]
    async fn registry_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proxy-port.json");

        write_port_registry(&path, 3005).await.expect("write");
        let data = tokio::fs::read(&path).await.expect("read");
        let registry: PortRegistry = serde_json::from_slice(&data).expect("parse");
        assert_eq!(registry.port, 3005);
        assert!(!registry.updated_at.is_empty());

        // Overwrite, never append.
        write_port_registry(&path, 3006).await.expect("write");
        let data = tokio::fs::read(&path).await.expect("read");
        let registry: PortRegistry = serde_json::from_slice(&data).expect("parse");
        assert_eq!(registry.port, 3006);
    }

    #[tokio::test]
    async fn registry_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("proxy-port.json");
        assert!(write_port_registry(&path, 3005).await.is_err());
    }
}
