//! Worker pairs
//!
//! A worker pair is a tor circuit process chained to a privoxy forwarder.
//! Only the forwarder's port is advertised through the reverse proxy.

mod pair;
mod privoxy;
mod state;
mod tor;

pub use pair::WorkerPair;
pub use privoxy::Privoxy;
pub use state::{PairEvent, PairState, RetireReason};
pub use tor::Tor;

use std::path::Path;

use async_trait::async_trait;
use tokio::fs::DirBuilder;

use crate::config::{BinaryConfig, PoolConfig};
use crate::error::Result;
use crate::process::ProcessSpec;

/// Prepares and describes the two processes of a pair
///
/// Implementations may write whatever files their programs need into `dir`;
/// the pair removes the directory on teardown.
#[async_trait]
pub trait PairLauncher: Send + Sync {
    /// Circuit process listening on `port`
    async fn circuit(&self, port: u16, dir: &Path) -> Result<ProcessSpec>;

    /// Forwarder listening on `port` and relaying to `circuit_port`
    async fn forwarder(&self, port: u16, circuit_port: u16, dir: &Path) -> Result<ProcessSpec>;
}

/// tor + privoxy
#[derive(Debug, Clone)]
pub struct TorPrivoxy {
    tor: Tor,
    privoxy: Privoxy,
}

impl TorPrivoxy {
    pub fn new(binaries: &BinaryConfig, pool: &PoolConfig) -> Self {
        Self {
            tor: Tor::new(&binaries.tor, pool.circuit_period, pool.settle),
            privoxy: Privoxy::new(&binaries.privoxy, pool.settle),
        }
    }
}

#[async_trait]
impl PairLauncher for TorPrivoxy {
    async fn circuit(&self, port: u16, dir: &Path) -> Result<ProcessSpec> {
        // tor refuses a data directory readable by others
        DirBuilder::new().recursive(true).mode(0o700).create(dir).await?;
        Ok(self.tor.spec(port, dir))
    }

    async fn forwarder(&self, port: u16, circuit_port: u16, dir: &Path) -> Result<ProcessSpec> {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(
            Privoxy::conf_path(dir),
            Privoxy::render_config(dir, port, circuit_port),
        )
        .await?;
        Ok(self.privoxy.spec(port, dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn launcher() -> TorPrivoxy {
        let binaries = BinaryConfig {
            tor: "tor".to_string(),
            privoxy: "privoxy".to_string(),
            haproxy: "haproxy".to_string(),
        };
        TorPrivoxy::new(&binaries, &PoolConfig::default())
    }

    #[tokio::test]
    async fn test_circuit_dir_is_private() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("tor-30000");

        let spec = launcher().circuit(30000, &dir).await.unwrap();
        assert_eq!(spec.program, "tor");

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_forwarder_writes_config() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("privoxy-30001");

        let spec = launcher().forwarder(30001, 30000, &dir).await.unwrap();
        assert_eq!(spec.program, "privoxy");

        let config = std::fs::read_to_string(dir.join("privoxy.conf")).unwrap();
        assert!(config.contains("listen-address  127.0.0.1:30001"));
        assert!(config.contains("forward-socks5t / 127.0.0.1:30000 ."));
    }
}
