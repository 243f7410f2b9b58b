//! Torotator - Rotating Tor Proxy Pool
//!
//! Keeps a pool of tor circuits, each fronted by a privoxy HTTP forwarder,
//! behind a single HAProxy entry point.
//!
//! ## Features
//!
//! - Bounded pool of worker pairs, recycled after a maximum lifetime
//! - Automatic replacement of pairs whose processes die
//! - Debounced, graceful HAProxy reloads as backends come and go
//! - Child process output re-emitted as structured logs
//! - Optional read-only status API

pub mod api;
pub mod config;
pub mod deps;
pub mod error;
pub mod haproxy;
pub mod ports;
pub mod process;
pub mod rotation;
pub mod worker;

pub use config::Config;
pub use error::{Result, RotatorError};
pub use haproxy::ReverseProxy;
pub use ports::{PortAllocator, PortLease};
pub use process::SupervisedProcess;
pub use rotation::{Scheduler, ShutdownHandle};
pub use worker::{PairLauncher, WorkerPair};
