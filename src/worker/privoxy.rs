//! Privoxy HTTP forwarder

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::process::{PrivoxyLog, ProcessSpec};

/// Launch recipe for one privoxy instance chained to a tor listener
#[derive(Debug, Clone)]
pub struct Privoxy {
    program: String,
    settle: Duration,
}

impl Privoxy {
    pub fn new(program: impl Into<String>, settle: Duration) -> Self {
        Self {
            program: program.into(),
            settle,
        }
    }

    pub fn conf_path(dir: &Path) -> std::path::PathBuf {
        dir.join("privoxy.conf")
    }

    /// Configuration listening on `port` and forwarding to tor on `circuit_port`
    pub fn render_config(dir: &Path, port: u16, circuit_port: u16) -> String {
        format!(
            "user-manual /usr/share/doc/privoxy/user-manual/
confdir /etc/privoxy
logdir {logdir}
actionsfile match-all.action
actionsfile default.action
actionsfile user.action
filterfile default.filter
filterfile user.filter
logfile logfile
listen-address  127.0.0.1:{port}
forward-socks5t / 127.0.0.1:{circuit_port} .
toggle  1
enable-remote-toggle  0
enable-remote-http-toggle  0
enable-edit-actions 0
enforce-blocks 0
buffer-limit 4096
enable-proxy-authentication-forwarding 0
forwarded-connect-retries  0
accept-intercepted-requests 0
allow-cgi-request-crunching 0
split-large-forms 0
keep-alive-timeout 5
tolerate-pipelining 1
socket-timeout 300
",
            logdir = dir.display(),
        )
    }

    /// Expects the configuration from [`Privoxy::render_config`] to be in `dir`
    pub fn spec(&self, port: u16, dir: &Path) -> ProcessSpec {
        ProcessSpec::new("privoxy", port, &self.program)
            .arg("--no-daemon")
            .arg("--pidfile")
            .arg(dir.join("privoxy.pid").display().to_string())
            .arg(Self::conf_path(dir).display().to_string())
            .classifier(Arc::new(PrivoxyLog))
            .settle(self.settle)
    }
}
