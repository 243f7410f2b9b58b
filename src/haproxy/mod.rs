//! Reverse proxy control
//!
//! This module keeps a single HAProxy entry point in sync with the set of
//! live worker pairs:
//! - configuration rendering from the backend registry
//! - debounced reloads through a graceful `-sf` handoff
//! - supervision of the running instance

mod controller;
mod registry;
mod render;

pub use controller::{ProxyStatus, ReloadEvent, ReloadState, ReverseProxy};
pub use registry::BackendRegistry;
pub use render::{render, rendered_backends, ProxyDescriptor};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::process::{HaproxyLog, ProcessSpec};

/// Load-balancing policy of the `privoxies` backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
}

impl BalanceStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "least_connections" | "leastconnections" | "least-connections" | "least_conn"
            | "leastconn" => Self::LeastConnections,
            _ => Self::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
        }
    }

    /// HAProxy `balance` keyword
    pub fn directive(&self) -> &'static str {
        match self {
            Self::RoundRobin => "roundrobin",
            Self::LeastConnections => "leastconn",
        }
    }
}

/// Builds the launch spec of a reverse proxy instance
///
/// `previous` is the pid of the instance being replaced; the new instance
/// must take over its listeners and let it finish in-flight connections.
pub trait ProxyCommand: Send + Sync {
    fn spec(&self, conf: &Path, pid_file: &Path, previous: Option<u32>) -> ProcessSpec;
}

/// `haproxy -f <conf> -p <pid file> [-sf <pid>]`
#[derive(Debug, Clone)]
pub struct HaproxyCommand {
    program: String,
    port: u16,
    settle: Duration,
}

impl HaproxyCommand {
    pub fn new(program: impl Into<String>, port: u16, settle: Duration) -> Self {
        Self {
            program: program.into(),
            port,
            settle,
        }
    }
}

impl ProxyCommand for HaproxyCommand {
    fn spec(&self, conf: &Path, pid_file: &Path, previous: Option<u32>) -> ProcessSpec {
        let mut spec = ProcessSpec::new("haproxy", self.port, &self.program)
            .arg("-f")
            .arg(conf.display().to_string())
            .arg("-p")
            .arg(pid_file.display().to_string())
            .classifier(Arc::new(HaproxyLog))
            .settle(self.settle);

        if let Some(pid) = previous {
            spec = spec.arg("-sf").arg(pid.to_string());
        }
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_balance_strategy_from_str() {
        assert_eq!(
            BalanceStrategy::from_str("round_robin"),
            BalanceStrategy::RoundRobin
        );
        assert_eq!(
            BalanceStrategy::from_str("least-connections"),
            BalanceStrategy::LeastConnections
        );
        assert_eq!(
            BalanceStrategy::from_str("LEASTCONN"),
            BalanceStrategy::LeastConnections
        );
        assert_eq!(
            BalanceStrategy::from_str("unknown"),
            BalanceStrategy::RoundRobin
        );
    }

    #[test]
    fn test_balance_strategy_as_str() {
        assert_eq!(BalanceStrategy::RoundRobin.as_str(), "round_robin");
        assert_eq!(
            BalanceStrategy::LeastConnections.as_str(),
            "least_connections"
        );
    }

    #[test]
    fn test_haproxy_command_args() {
        let command = HaproxyCommand::new("haproxy", 8080, Duration::from_millis(250));
        let conf = PathBuf::from("/tmp/rot/haproxy/haproxy.cfg");
        let pid = PathBuf::from("/tmp/rot/haproxy/haproxy.pid");

        let first = command.spec(&conf, &pid, None);
        assert_eq!(first.service, "haproxy");
        assert_eq!(first.port, 8080);
        assert_eq!(
            first.args,
            vec![
                "-f",
                "/tmp/rot/haproxy/haproxy.cfg",
                "-p",
                "/tmp/rot/haproxy/haproxy.pid"
            ]
        );

        let handoff = command.spec(&conf, &pid, Some(4242));
        assert_eq!(&handoff.args[4..], &["-sf".to_string(), "4242".to_string()]);
    }
}
