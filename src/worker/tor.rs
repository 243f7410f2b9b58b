//! Tor circuit process

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::process::{ProcessSpec, TorLog};

/// Launch recipe for one tor SOCKS listener
#[derive(Debug, Clone)]
pub struct Tor {
    program: String,
    circuit_period: Duration,
    log_level: String,
    settle: Duration,
}

impl Tor {
    pub fn new(program: impl Into<String>, circuit_period: Duration, settle: Duration) -> Self {
        Self {
            program: program.into(),
            circuit_period,
            log_level: "notice".to_string(),
            settle,
        }
    }

    /// Minimum severity tor writes to stdout
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// `dir` doubles as tor's data directory and holds its pid file
    pub fn spec(&self, port: u16, dir: &Path) -> ProcessSpec {
        ProcessSpec::new("tor", port, &self.program)
            .arg("--allow-missing-torrc")
            .arg("--SocksPort")
            .arg(port.to_string())
            .arg("--NewCircuitPeriod")
            .arg(self.circuit_period.as_secs().to_string())
            .arg("--DataDirectory")
            .arg(dir.display().to_string())
            .arg("--PidFile")
            .arg(dir.join("tor.pid").display().to_string())
            .arg("--Log")
            .arg(format!("{} stdout", self.log_level))
            .classifier(Arc::new(TorLog))
            .settle(self.settle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_tor_args() {
        let tor = Tor::new("tor", Duration::from_secs(120), Duration::from_millis(250));
        let spec = tor.spec(30000, &PathBuf::from("/tmp/rot/tor-30000"));

        assert_eq!(spec.service, "tor");
        assert_eq!(spec.port, 30000);
        assert_eq!(
            spec.args,
            vec![
                "--allow-missing-torrc",
                "--SocksPort",
                "30000",
                "--NewCircuitPeriod",
                "120",
                "--DataDirectory",
                "/tmp/rot/tor-30000",
                "--PidFile",
                "/tmp/rot/tor-30000/tor.pid",
                "--Log",
                "notice stdout",
            ]
        );
    }

    #[test]
    fn test_tor_log_level() {
        let tor = Tor::new("tor", Duration::from_secs(60), Duration::from_millis(250))
            .log_level("warn");
        let spec = tor.spec(30000, &PathBuf::from("/tmp/tor"));
        assert_eq!(spec.args.last().map(String::as_str), Some("warn stdout"));
    }
}
