//! Backend registry

use std::collections::BTreeSet;

use parking_lot::Mutex;

/// Ports currently eligible to receive traffic
///
/// The lock is only held for the set operation itself; callers request a
/// reload after releasing it.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    ports: Mutex<BTreeSet<u16>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the port was already registered
    pub fn insert(&self, port: u16) -> bool {
        self.ports.lock().insert(port)
    }

    /// Returns false if the port was not registered
    pub fn remove(&self, port: u16) -> bool {
        self.ports.lock().remove(&port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ports.lock().contains(&port)
    }

    pub fn snapshot(&self) -> BTreeSet<u16> {
        self.ports.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.ports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.lock().is_empty()
    }
}
