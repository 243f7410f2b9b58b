//! A running circuit + forwarder pair

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Result, RotatorError};
use crate::ports::PortLease;
use crate::process::{ProcessSpec, SupervisedProcess};
use crate::rotation::shutdown_requested;

use super::{PairLauncher, RetireReason};

/// Both processes of a pair, their directories and their port leases
///
/// The leases are held until teardown has removed the directories, so no
/// other pair can reuse a port whose process may still be exiting.
#[derive(Debug)]
pub struct WorkerPair {
    circuit: SupervisedProcess,
    forwarder: SupervisedProcess,
    circuit_dir: PathBuf,
    forwarder_dir: PathBuf,
    circuit_lease: PortLease,
    forwarder_lease: PortLease,
}

impl WorkerPair {
    /// Start the circuit, then the forwarder chained to it
    ///
    /// A forwarder that fails to start takes the already running circuit
    /// down with it. Shutdown interrupts either settle window with
    /// [`RotatorError::ShuttingDown`]. On any error both directories are gone
    /// and the leases are released.
    pub async fn start(
        launcher: &dyn PairLauncher,
        work_dir: &Path,
        circuit_lease: PortLease,
        forwarder_lease: PortLease,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Self> {
        let circuit_port = circuit_lease.port();
        let forwarder_port = forwarder_lease.port();
        let circuit_dir = work_dir.join(format!("tor-{circuit_port}"));
        let forwarder_dir = work_dir.join(format!("privoxy-{forwarder_port}"));

        let spec = launcher.circuit(circuit_port, &circuit_dir).await;
        let circuit = launch(spec, &circuit_dir, shutdown).await?;

        let spec = launcher
            .forwarder(forwarder_port, circuit_port, &forwarder_dir)
            .await;
        let forwarder = match launch(spec, &forwarder_dir, shutdown).await {
            Ok(forwarder) => forwarder,
            Err(e) => {
                stop(&circuit).await;
                remove_dir(&circuit_dir).await;
                return Err(e);
            }
        };

        info!(tor = circuit_port, privoxy = forwarder_port, "proxy started");
        Ok(Self {
            circuit,
            forwarder,
            circuit_dir,
            forwarder_dir,
            circuit_lease,
            forwarder_lease,
        })
    }

    /// Port to advertise through the reverse proxy
    pub fn port(&self) -> u16 {
        self.forwarder_lease.port()
    }

    pub fn circuit_port(&self) -> u16 {
        self.circuit_lease.port()
    }

    pub fn circuit(&self) -> &SupervisedProcess {
        &self.circuit
    }

    pub fn forwarder(&self) -> &SupervisedProcess {
        &self.forwarder
    }

    /// Suspend until the first reason to retire this pair
    pub async fn retired(
        &self,
        lifetime: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RetireReason {
        let mut circuit = self.circuit.reaped();
        let mut forwarder = self.forwarder.reaped();

        tokio::select! {
            // a dropped sender counts as shutdown too
            _ = shutdown_requested(shutdown) => RetireReason::Shutdown,
            _ = circuit.fired() => RetireReason::CircuitExited,
            _ = forwarder.fired() => RetireReason::ForwarderExited,
            _ = tokio::time::sleep(lifetime) => RetireReason::Expired,
        }
    }

    /// Terminate the forwarder and the circuit, then remove their
    /// directories; the ports are released last
    pub async fn teardown(self) {
        let Self {
            circuit,
            forwarder,
            circuit_dir,
            forwarder_dir,
            circuit_lease,
            forwarder_lease,
        } = self;

        stop(&forwarder).await;
        stop(&circuit).await;
        remove_dir(&forwarder_dir).await;
        remove_dir(&circuit_dir).await;

        info!(
            tor = circuit_lease.port(),
            privoxy = forwarder_lease.port(),
            "proxy terminated"
        );
        drop(forwarder_lease);
        drop(circuit_lease);
    }
}

async fn launch(
    spec: Result<ProcessSpec>,
    dir: &Path,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SupervisedProcess> {
    let result = match spec {
        // dropping a half-started process kills it
        Ok(spec) => tokio::select! {
            result = SupervisedProcess::start(spec) => result,
            _ = shutdown_requested(shutdown) => Err(RotatorError::ShuttingDown),
        },
        Err(e) => Err(e),
    };
    if result.is_err() {
        remove_dir(dir).await;
    }
    result
}

async fn stop(process: &SupervisedProcess) {
    info!(service = process.service(), port = process.port(), pid = process.pid(), "cleaning up");
    if let Err(e) = process.terminate().await {
        warn!(
            service = process.service(),
            port = process.port(),
            pid = process.pid(),
            error = %e,
            "failed to kill server"
        );
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove directory"),
    }
}
