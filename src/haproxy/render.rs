//! HAProxy configuration rendering
//!
//! Rendering is a pure function of [`ProxyDescriptor`]: the same descriptor
//! always produces byte-identical output.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::config::ProxyConfig;
use crate::error::{Result, RotatorError};

use super::BalanceStrategy;

/// Everything the rendered configuration depends on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub port: u16,
    pub stats_port: Option<u16>,
    pub max_conn: u32,
    pub balance: BalanceStrategy,
    pub backends: BTreeSet<u16>,
}

impl ProxyDescriptor {
    pub fn new(config: &ProxyConfig, backends: BTreeSet<u16>) -> Self {
        Self {
            port: config.port,
            stats_port: config.stats_port,
            max_conn: config.max_conn,
            balance: config.balance,
            backends,
        }
    }
}

/// Render the full HAProxy configuration
pub fn render(desc: &ProxyDescriptor) -> Result<String> {
    let mut out = String::with_capacity(1024 + desc.backends.len() * 64);
    write_config(&mut out, desc).map_err(|e| RotatorError::Render(e.to_string()))?;
    Ok(out)
}

fn write_config(out: &mut String, desc: &ProxyDescriptor) -> std::fmt::Result {
    writeln!(out, "global")?;
    writeln!(out, "  maxconn {}", desc.max_conn)?;
    writeln!(out)?;

    writeln!(out, "defaults")?;
    writeln!(out, "  mode http")?;
    writeln!(out, "  maxconn 1024")?;
    writeln!(out, "  option  httplog")?;
    writeln!(out, "  option  dontlognull")?;
    writeln!(out, "  retries 3")?;
    writeln!(out, "  timeout connect 5s")?;
    writeln!(out, "  timeout client  30s")?;
    writeln!(out, "  timeout server  30s")?;
    writeln!(out)?;

    if let Some(stats_port) = desc.stats_port {
        writeln!(out, "listen stats")?;
        writeln!(out, "  bind            :{}", stats_port)?;
        writeln!(out, "  mode            http")?;
        writeln!(out, "  maxconn 10")?;
        writeln!(out, "  timeout client  100s")?;
        writeln!(out, "  timeout server  100s")?;
        writeln!(out, "  timeout connect 100s")?;
        writeln!(out, "  timeout queue   100s")?;
        writeln!(out, "  stats enable")?;
        writeln!(out, "  stats hide-version")?;
        writeln!(out, "  stats refresh 30s")?;
        writeln!(out, "  stats show-node")?;
        writeln!(out, "  stats uri /haproxy?stats")?;
        writeln!(out)?;
    }

    writeln!(out, "frontend rotating_proxies")?;
    writeln!(out, "  bind *:{}", desc.port)?;
    writeln!(out, "  default_backend privoxies")?;
    writeln!(out, "  option http_proxy")?;
    writeln!(out)?;

    writeln!(out, "backend privoxies")?;
    writeln!(out, "  balance {}", desc.balance.directive())?;
    writeln!(out, "  timeout http-keep-alive 3000")?;
    writeln!(out, "  option forwardfor")?;
    writeln!(out, "  option http-server-close")?;
    writeln!(out, "  option http_proxy")?;
    for port in &desc.backends {
        writeln!(out, "  server privoxy-{port} 127.0.0.1:{port} check")?;
    }

    Ok(())
}

/// Ports listed as `server` lines in a rendered configuration
pub fn rendered_backends(config: &str) -> Vec<u16> {
    config
        .lines()
        .filter_map(|line| line.trim().strip_prefix("server privoxy-"))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|port| port.parse().ok())
        .collect()
}
