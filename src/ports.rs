//! Port allocation for worker processes
//!
//! Ports are handed out from a configured range with a wrapping cursor. Every
//! outstanding lease is recorded in an in-use set guarded by the same lock as
//! the cursor, so a port is never handed out twice while a process may still
//! be bound to it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::PortRangeConfig;
use crate::error::{Result, RotatorError};

/// Issues port leases from `[floor, ceiling)`
pub struct PortAllocator {
    floor: u16,
    ceiling: u16,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    next: u16,
    leased: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(range: PortRangeConfig) -> Arc<Self> {
        Arc::new(Self {
            floor: range.start,
            ceiling: range.end,
            state: Mutex::new(AllocatorState {
                next: range.start,
                leased: HashSet::new(),
            }),
        })
    }

    /// Lease the next free port after the cursor
    ///
    /// Returns `PortsExhausted` when every port of the range is leased.
    pub fn lease(self: &Arc<Self>) -> Result<PortLease> {
        let mut state = self.state.lock();
        let span = usize::from(self.ceiling - self.floor);

        for _ in 0..span {
            let candidate = state.next;
            state.next = if candidate + 1 >= self.ceiling {
                debug!(port = self.floor, "port cursor wrapped");
                self.floor
            } else {
                candidate + 1
            };

            if state.leased.insert(candidate) {
                return Ok(PortLease {
                    port: candidate,
                    allocator: Arc::clone(self),
                });
            }
        }

        Err(RotatorError::PortsExhausted {
            floor: self.floor,
            ceiling: self.ceiling,
        })
    }

    /// Currently leased ports, sorted
    pub fn in_use(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.state.lock().leased.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    fn release(&self, port: u16) {
        self.state.lock().leased.remove(&port);
    }
}

/// A leased port; dropping the lease returns the port to the allocator
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PortLease").field(&self.port).finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}
