//! Pool counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Lock-free counters updated by pair tasks
#[derive(Debug, Default)]
pub struct PoolStats {
    live: AtomicUsize,
    started: AtomicU64,
    retired: AtomicU64,
    launch_failures: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    /// Pairs currently registered with the reverse proxy
    pub live: usize,
    pub started: u64,
    pub retired: u64,
    pub launch_failures: u64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn pair_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pair_registered(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pair_retired(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn launch_failed(&self) {
        self.launch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }

    pub fn launch_failures(&self) -> u64 {
        self.launch_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, capacity: usize) -> PoolStatus {
        PoolStatus {
            capacity,
            live: self.live(),
            started: self.started(),
            retired: self.retired(),
            launch_failures: self.launch_failures(),
        }
    }
}
