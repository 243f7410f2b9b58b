//! Rotation scheduler
//!
//! Keeps up to `capacity` worker pairs alive. Each admitted pair runs on its
//! own task and walks the [`PairState`] machine until it is done; its
//! admission permit is released only after teardown has finished.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::config::PoolConfig;
use crate::error::{Result, RotatorError};
use crate::haproxy::ReverseProxy;
use crate::ports::{PortAllocator, PortLease};
use crate::worker::{PairEvent, PairLauncher, PairState, WorkerPair};

use super::shutdown_requested;
use super::stats::{PoolStats, PoolStatus};

/// Admits worker pairs up to the pool capacity and replaces them as they retire
pub struct Scheduler {
    config: PoolConfig,
    work_dir: PathBuf,
    ports: Arc<PortAllocator>,
    proxy: Arc<ReverseProxy>,
    launcher: Arc<dyn PairLauncher>,
    gate: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    next_id: AtomicU64,
}

impl Scheduler {
    pub fn new(
        config: PoolConfig,
        work_dir: PathBuf,
        ports: Arc<PortAllocator>,
        proxy: Arc<ReverseProxy>,
        launcher: Arc<dyn PairLauncher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(Semaphore::new(config.size)),
            config,
            work_dir,
            ports,
            proxy,
            launcher,
            stats: Arc::new(PoolStats::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    pub fn status(&self) -> PoolStatus {
        self.stats.snapshot(self.config.size)
    }

    /// Admission slots not held by any pair
    pub fn available(&self) -> usize {
        self.gate.available_permits()
    }

    /// Admit pairs until shutdown, then wait for every pair to retire
    #[instrument(skip_all, fields(capacity = self.config.size))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting rotation scheduler");
        let mut pairs = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                permit = Arc::clone(&self.gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(result) = pairs.try_join_next() {
                reap(result);
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let scheduler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            pairs.spawn(
                async move {
                    scheduler.run_pair(shutdown).await;
                    drop(permit);
                }
                .instrument(info_span!("pair", id)),
            );
        }

        info!(pairs = pairs.len(), "admission stopped; waiting for pairs to retire");
        while let Some(result) = pairs.join_next().await {
            reap(result);
        }
        info!("all pairs retired");
    }

    /// Drive one pair from allocation to teardown
    async fn run_pair(&self, mut shutdown: watch::Receiver<bool>) {
        let mut state = PairState::Allocating;
        let mut leases = None;
        let mut pair = None;

        while !state.is_done() {
            let event = match state {
                PairState::Allocating => self.allocate(&mut leases, &mut shutdown).await,
                PairState::Starting => self.launch(&mut leases, &mut pair, &mut shutdown).await,
                PairState::Registered => self.serve(pair.as_ref(), &mut shutdown).await,
                PairState::Retiring => self.retire(pair.take()).await,
                PairState::Done => break,
            };

            state = match state.on(event) {
                Some(next) => {
                    debug!(from = %state, to = %next, ?event, "pair transition");
                    next
                }
                None => {
                    error!(%state, ?event, "invalid pair transition");
                    PairState::Done
                }
            };
        }

        // only reachable after an invalid transition
        if let Some(pair) = pair {
            self.retire(Some(pair)).await;
        }
    }

    async fn allocate(
        &self,
        leases: &mut Option<(PortLease, PortLease)>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PairEvent {
        if *shutdown.borrow() {
            return PairEvent::Shutdown;
        }

        match self.lease_ports() {
            Ok(pair) => {
                *leases = Some(pair);
                PairEvent::PortsLeased
            }
            Err(e) => {
                self.stats.launch_failed();
                warn!(error = %e, "failed to lease ports");
                self.retry_after_backoff(shutdown).await
            }
        }
    }

    fn lease_ports(&self) -> Result<(PortLease, PortLease)> {
        let circuit = self.ports.lease()?;
        let forwarder = self.ports.lease()?;
        Ok((circuit, forwarder))
    }

    async fn launch(
        &self,
        leases: &mut Option<(PortLease, PortLease)>,
        pair: &mut Option<WorkerPair>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PairEvent {
        let Some((circuit, forwarder)) = leases.take() else {
            return PairEvent::LaunchFailed;
        };

        let started = WorkerPair::start(
            self.launcher.as_ref(),
            &self.work_dir,
            circuit,
            forwarder,
            shutdown,
        )
        .await;

        match started {
            Err(RotatorError::ShuttingDown) => PairEvent::Shutdown,
            Ok(started) if *shutdown.borrow() => {
                started.teardown().await;
                PairEvent::Shutdown
            }
            Ok(started) => {
                self.stats.pair_started();
                *pair = Some(started);
                PairEvent::Launched
            }
            Err(e) => {
                self.stats.launch_failed();
                warn!(error = %e, "failed to start proxy");
                self.retry_after_backoff(shutdown).await
            }
        }
    }

    /// Advertise the pair and wait for its first retirement condition
    async fn serve(
        &self,
        pair: Option<&WorkerPair>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PairEvent {
        if let Some(pair) = pair {
            self.proxy.register(pair.port());
            self.stats.pair_registered();

            let reason = pair.retired(self.config.max_lifetime, shutdown).await;
            info!(
                tor = pair.circuit_port(),
                privoxy = pair.port(),
                %reason,
                "stopping proxy"
            );
        }
        PairEvent::Retire
    }

    /// Deregister before any process is killed so no traffic is routed to a
    /// dying backend
    async fn retire(&self, pair: Option<WorkerPair>) -> PairEvent {
        if let Some(pair) = pair {
            self.proxy.deregister(pair.port());
            pair.teardown().await;
            self.stats.pair_retired();
        }
        PairEvent::TornDown
    }

    /// `LaunchFailed` once the backoff has elapsed, `Shutdown` if shutdown
    /// was requested meanwhile
    async fn retry_after_backoff(&self, shutdown: &mut watch::Receiver<bool>) -> PairEvent {
        let delay = self.backoff();
        debug!(delay_ms = delay.as_millis() as u64, "retrying after backoff");

        tokio::select! {
            _ = tokio::time::sleep(delay) => PairEvent::LaunchFailed,
            _ = shutdown_requested(shutdown) => PairEvent::Shutdown,
        }
    }

    /// Base backoff plus up to 20% jitter so failing pairs do not retry in
    /// lockstep
    fn backoff(&self) -> Duration {
        let base = self.config.retry_backoff;
        let spread = (base.as_millis() / 5) as u64;
        let jitter = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(jitter)
    }
}

fn reap(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "pair task failed");
    }
}
