//! Debounced reload controller
//!
//! Registry changes arrive in bursts when several pairs expire together, and
//! every HAProxy reload costs a process handoff. Requests therefore go
//! through a single-slot queue into one debounce task:
//!
//! ```text
//! Idle --request--> Pending --quiet period or ceiling--> Reloading --> Idle
//!                     ^   |
//!                     +---+ request (re-arms the quiet period)
//! ```
//!
//! A reload always renders the registry as it is when the reload executes,
//! never as it was when the request was made.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ProxyConfig, ReloadConfig};
use crate::error::{Result, RotatorError};
use crate::process::SupervisedProcess;
use crate::rotation::shutdown_requested;

use super::registry::BackendRegistry;
use super::render::{render, ProxyDescriptor};
use super::{BalanceStrategy, ProxyCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReloadRequest {
    Debounced,
    Immediate,
}

/// Where the reload state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadState {
    Idle,
    Pending,
    Reloading,
}

/// Published after every executed reload
#[derive(Debug, Clone, Serialize)]
pub struct ReloadEvent {
    pub generation: u64,
    /// Backends rendered into the configuration
    pub backends: Vec<u16>,
    /// Pid of the instance serving after the reload
    pub pid: Option<u32>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl ReloadEvent {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Snapshot of the reverse proxy for the status API
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub port: u16,
    pub stats_port: Option<u16>,
    pub balance: BalanceStrategy,
    pub state: ReloadState,
    pub pid: Option<u32>,
    pub backends: Vec<u16>,
    pub reloads: u64,
    pub last_reload: Option<ReloadEvent>,
}

/// Supervises the HAProxy instance and keeps it in sync with the registry
pub struct ReverseProxy {
    config: ProxyConfig,
    timings: ReloadConfig,
    dir: PathBuf,
    conf: PathBuf,
    pid_file: PathBuf,
    command: Arc<dyn ProxyCommand>,
    registry: BackendRegistry,
    current: ArcSwapOption<SupervisedProcess>,
    retiring: Arc<Mutex<Vec<Arc<SupervisedProcess>>>>,
    state: Mutex<ReloadState>,
    generation: AtomicU64,
    last_reload: Mutex<Option<ReloadEvent>>,
    requests: mpsc::Sender<ReloadRequest>,
    events: broadcast::Sender<ReloadEvent>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReverseProxy {
    /// Write the initial configuration, start the first instance and the
    /// debounce task
    ///
    /// Any error here is fatal: without a running entry point nothing else
    /// is useful.
    pub async fn start(
        config: ProxyConfig,
        timings: ReloadConfig,
        dir: PathBuf,
        command: Arc<dyn ProxyCommand>,
    ) -> Result<Arc<Self>> {
        let (requests, requests_rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(64);
        let (stop, stop_rx) = watch::channel(false);

        let proxy = Arc::new(Self {
            conf: dir.join("haproxy.cfg"),
            pid_file: dir.join("haproxy.pid"),
            dir,
            config,
            timings,
            command,
            registry: BackendRegistry::new(),
            current: ArcSwapOption::empty(),
            retiring: Arc::new(Mutex::new(Vec::new())),
            state: Mutex::new(ReloadState::Idle),
            generation: AtomicU64::new(0),
            last_reload: Mutex::new(None),
            requests,
            events,
            stop,
            task: Mutex::new(None),
        });

        tokio::fs::create_dir_all(&proxy.dir).await?;
        proxy.write_config(&BTreeSet::new()).await?;

        let spec = proxy.command.spec(&proxy.conf, &proxy.pid_file, None);
        let first = SupervisedProcess::start(spec).await?;
        info!(port = proxy.config.port, pid = first.pid(), "reverse proxy started");
        proxy.current.store(Some(Arc::new(first)));

        let task = tokio::spawn(proxy.clone().run_reloads(requests_rx, stop_rx));
        *proxy.task.lock() = Some(task);

        Ok(proxy)
    }

    /// Add a backend and schedule a reload
    pub fn register(&self, port: u16) {
        if self.registry.insert(port) {
            info!(port, "backend registered");
        }
        self.request_reload();
    }

    /// Remove a backend and schedule a reload
    pub fn deregister(&self, port: u16) {
        if self.registry.remove(port) {
            info!(port, "backend deregistered");
        }
        self.request_reload();
    }

    /// Queue a debounced reload; a request already waiting in the queue
    /// absorbs this one
    pub fn request_reload(&self) {
        match self.requests.try_send(ReloadRequest::Debounced) {
            Ok(()) => debug!("reload queued"),
            Err(TrySendError::Full(_)) => debug!("reload already queued"),
            Err(TrySendError::Closed(_)) => debug!("reload loop stopped; request dropped"),
        }
    }

    /// Reload without waiting out the quiet period
    pub async fn reload_now(&self) {
        if self.requests.send(ReloadRequest::Immediate).await.is_err() {
            warn!("reload loop stopped; immediate reload dropped");
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Pid of the instance currently serving traffic
    pub fn pid(&self) -> Option<u32> {
        self.current.load_full().map(|p| p.pid())
    }

    pub fn config_path(&self) -> &Path {
        &self.conf
    }

    /// Receive an event after every executed reload
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ReloadState {
        *self.state.lock()
    }

    pub fn status(&self) -> ProxyStatus {
        ProxyStatus {
            port: self.config.port,
            stats_port: self.config.stats_port,
            balance: self.config.balance,
            state: self.state(),
            pid: self.pid(),
            backends: self.registry.snapshot().into_iter().collect(),
            reloads: self.generation.load(Ordering::Relaxed),
            last_reload: self.last_reload.lock().clone(),
        }
    }

    /// Stop reloading, terminate every instance and remove the working directory
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "reload task failed");
            }
        }

        let mut instances: Vec<Arc<SupervisedProcess>> = self.retiring.lock().drain(..).collect();
        if let Some(current) = self.current.swap(None) {
            instances.push(current);
        }

        for instance in instances {
            info!(pid = instance.pid(), "cleaning up");
            if let Err(e) = instance.terminate().await {
                warn!(pid = instance.pid(), error = %e, "failed to kill server");
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %self.dir.display(), error = %e, "failed to remove data directory");
            }
        }
    }

    fn set_state(&self, state: ReloadState) {
        *self.state.lock() = state;
    }

    async fn run_reloads(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<ReloadRequest>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let first = tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = shutdown_requested(&mut stop) => break,
            };

            self.set_state(ReloadState::Pending);
            if first == ReloadRequest::Debounced {
                let ceiling = Instant::now() + self.timings.ceiling;
                let mut quiet = Instant::now() + self.timings.quiet_period;

                loop {
                    tokio::select! {
                        request = requests.recv() => match request {
                            Some(ReloadRequest::Debounced) => {
                                debug!("reload deferred");
                                quiet = Instant::now() + self.timings.quiet_period;
                            }
                            Some(ReloadRequest::Immediate) | None => break,
                        },
                        _ = tokio::time::sleep_until(quiet.min(ceiling)) => {
                            if quiet > ceiling {
                                warn!("changes kept arriving; forcing reload");
                            }
                            break;
                        }
                        _ = shutdown_requested(&mut stop) => {
                            self.set_state(ReloadState::Idle);
                            return;
                        }
                    }
                }
            }

            self.set_state(ReloadState::Reloading);
            self.execute_reload().await;
            self.set_state(ReloadState::Idle);
        }

        self.set_state(ReloadState::Idle);
    }

    #[instrument(skip(self), fields(port = self.config.port))]
    async fn execute_reload(&self) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let backends = self.registry.snapshot();

        let result = self.handoff(&backends).await;
        let error = match &result {
            Ok(pid) => {
                info!(generation, pid, backends = backends.len(), "reverse proxy reloaded");
                None
            }
            Err(e) => {
                error!(generation, error = %e, "failed to gracefully reload");
                Some(e.to_string())
            }
        };

        let event = ReloadEvent {
            generation,
            backends: backends.into_iter().collect(),
            pid: self.pid(),
            error,
            at: Utc::now(),
        };
        *self.last_reload.lock() = Some(event.clone());
        let _ = self.events.send(event);
    }

    /// Render, then start a replacement that takes over from the current
    /// instance. On failure the current instance keeps serving.
    async fn handoff(&self, backends: &BTreeSet<u16>) -> Result<u32> {
        self.write_config(backends).await?;

        let previous = self.current.load_full();
        let spec = self
            .command
            .spec(&self.conf, &self.pid_file, previous.as_ref().map(|p| p.pid()));
        let next = SupervisedProcess::start(spec)
            .await
            .map_err(|e| RotatorError::Handoff(e.to_string()))?;

        let pid = next.pid();
        self.current.store(Some(Arc::new(next)));
        if let Some(previous) = previous {
            self.retire(previous);
        }
        Ok(pid)
    }

    /// Let a replaced instance finish its connections, then reap it
    fn retire(&self, previous: Arc<SupervisedProcess>) {
        self.retiring.lock().push(previous.clone());
        let retiring = self.retiring.clone();
        let grace = self.timings.handoff_grace;

        tokio::spawn(async move {
            if tokio::time::timeout(grace, previous.wait()).await.is_err() {
                debug!(pid = previous.pid(), "previous instance outlived handoff grace");
            }
            if let Err(e) = previous.terminate().await {
                warn!(pid = previous.pid(), error = %e, "failed to clean up previous instance");
            }
            retiring.lock().retain(|p| !Arc::ptr_eq(p, &previous));
        });
    }

    /// Render into a temporary file and atomically move it into place
    async fn write_config(&self, backends: &BTreeSet<u16>) -> Result<()> {
        let descriptor = ProxyDescriptor::new(&self.config, backends.clone());
        let rendered = render(&descriptor)?;

        let tmp = self.conf.with_extension("cfg.tmp");
        let write = async {
            tokio::fs::write(&tmp, rendered).await?;
            tokio::fs::rename(&tmp, &self.conf).await?;
            Ok::<(), std::io::Error>(())
        };
        write.await.map_err(|e| {
            RotatorError::Render(format!("writing {}: {}", self.conf.display(), e))
        })
    }
}
