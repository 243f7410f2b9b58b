//! Shared fixtures: `sh` processes standing in for haproxy, tor and privoxy

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use torotator::config::{PoolConfig, PortRangeConfig, ProxyConfig, ReloadConfig};
use torotator::haproxy::{BalanceStrategy, ProxyCommand, ReloadEvent};
use torotator::process::ProcessSpec;
use torotator::{PairLauncher, PortAllocator, Result, ReverseProxy, Scheduler};

pub const SETTLE: Duration = Duration::from_millis(50);

pub fn sh(service: &str, port: u16, script: &str) -> ProcessSpec {
    ProcessSpec::new(service, port, "sh")
        .arg("-c")
        .arg(script)
        .settle(SETTLE)
}

/// Long sleep that ignores its configuration
pub struct SleepProxy;

impl ProxyCommand for SleepProxy {
    fn spec(&self, _conf: &Path, _pid_file: &Path, _previous: Option<u32>) -> ProcessSpec {
        sh("haproxy", 8080, "exec sleep 60")
    }
}

/// Counts launches; the first `short_lived` circuits exit on their own
pub struct ScriptLauncher {
    pub short_lived: usize,
    pub circuits: AtomicUsize,
    pub forwarders: AtomicUsize,
}

impl ScriptLauncher {
    pub fn new(short_lived: usize) -> Arc<Self> {
        Arc::new(Self {
            short_lived,
            circuits: AtomicUsize::new(0),
            forwarders: AtomicUsize::new(0),
        })
    }

    pub fn forwarder_launches(&self) -> usize {
        self.forwarders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PairLauncher for ScriptLauncher {
    async fn circuit(&self, port: u16, dir: &Path) -> Result<ProcessSpec> {
        tokio::fs::create_dir_all(dir).await?;
        let launch = self.circuits.fetch_add(1, Ordering::SeqCst);
        let script = if launch < self.short_lived {
            "sleep 1"
        } else {
            "exec sleep 60"
        };
        Ok(sh("circuit", port, script))
    }

    async fn forwarder(&self, port: u16, _circuit_port: u16, dir: &Path) -> Result<ProcessSpec> {
        tokio::fs::create_dir_all(dir).await?;
        self.forwarders.fetch_add(1, Ordering::SeqCst);
        Ok(sh("forwarder", port, "exec sleep 60"))
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub proxy: Arc<ReverseProxy>,
    pub ports: Arc<PortAllocator>,
    pub scheduler: Arc<Scheduler>,
    pub events: broadcast::Receiver<ReloadEvent>,
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

impl Harness {
    /// Start the reverse proxy and run a scheduler of `size` pairs
    pub async fn start(size: usize, range: PortRangeConfig, launcher: Arc<dyn PairLauncher>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let proxy = ReverseProxy::start(
            ProxyConfig {
                port: 8080,
                stats_port: None,
                max_conn: 256,
                balance: BalanceStrategy::RoundRobin,
            },
            ReloadConfig {
                quiet_period: Duration::from_millis(100),
                ceiling: Duration::from_millis(500),
                handoff_grace: Duration::from_millis(100),
            },
            dir.path().join("haproxy"),
            Arc::new(SleepProxy),
        )
        .await
        .unwrap();
        let events = proxy.subscribe();

        let ports = PortAllocator::new(range);
        let scheduler = Scheduler::new(
            PoolConfig {
                size,
                max_lifetime: Duration::from_secs(120),
                settle: SETTLE,
                retry_backoff: Duration::from_millis(50),
                ..PoolConfig::default()
            },
            dir.path().to_path_buf(),
            ports.clone(),
            proxy.clone(),
            launcher,
        );

        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(scheduler.clone().run(shutdown));

        Self {
            dir,
            proxy,
            ports,
            scheduler,
            events,
            stop,
            task,
        }
    }

    /// Next reload event matching `predicate`
    pub async fn reload_where(&mut self, predicate: impl Fn(&ReloadEvent) -> bool) -> ReloadEvent {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("reload events closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("no matching reload")
    }

    /// Request shutdown and wait for the scheduler to drain
    pub async fn shutdown(&mut self) {
        self.stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(15), &mut self.task)
            .await
            .expect("scheduler did not drain")
            .unwrap();
    }
}

pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
