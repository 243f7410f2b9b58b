use crate::error::{Result, RotatorError};
use crate::haproxy::BalanceStrategy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Entry-point reverse proxy configuration
    pub proxy: ProxyConfig,
    /// Worker pool configuration
    pub pool: PoolConfig,
    /// Port range handed to worker processes
    pub ports: PortRangeConfig,
    /// Debounced reload timings
    pub reload: ReloadConfig,
    /// Collaborator program names
    pub binaries: BinaryConfig,
    /// Status API configuration
    pub api: ApiServerConfig,
    /// Logging configuration
    pub log: LogConfig,
    /// Root directory for per-process working directories
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port clients connect to (default: 8080)
    pub port: u16,
    /// HAProxy stats port, disabled when unset
    pub stats_port: Option<u16>,
    /// Global connection ceiling
    pub max_conn: u32,
    /// Load-balancing policy across backends
    pub balance: BalanceStrategy,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrently live Tor+Privoxy pairs
    pub size: usize,
    /// Maximum time a pair stays online before being recycled
    pub max_lifetime: Duration,
    /// Tor NewCircuitPeriod
    pub circuit_period: Duration,
    /// How long a freshly started process must survive
    pub settle: Duration,
    /// Delay before retrying a failed launch
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRangeConfig {
    /// First port handed out
    pub start: u16,
    /// Ports at or above this value wrap back to `start`
    pub end: u16,
}

#[derive(Debug, Clone)]
pub struct ReloadConfig {
    /// Quiet period a burst of changes must respect before reloading
    pub quiet_period: Duration,
    /// Upper bound between the first request of a burst and its reload
    pub ceiling: Duration,
    /// How long a replaced instance may keep serving before it is killed
    pub handoff_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct BinaryConfig {
    pub tor: String,
    pub privoxy: String,
    pub haproxy: String,
}

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Serve the status API
    pub enabled: bool,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port for the status API (default: 8081)
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(2),
            ceiling: Duration::from_secs(10),
            handoff_grace: Duration::from_secs(30),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            max_lifetime: Duration::from_secs(900),
            circuit_period: Duration::from_secs(120),
            settle: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let stats_port: u16 = parse_env("STATS_PORT", "0")?;
        let ports = PortRangeConfig {
            start: parse_env("PORT_RANGE_START", "30000")?,
            end: parse_env("PORT_RANGE_END", "65535")?,
        };
        if ports.start >= ports.end {
            return Err(RotatorError::InvalidConfig(format!(
                "PORT_RANGE_START ({}) must be below PORT_RANGE_END ({})",
                ports.start, ports.end
            )));
        }

        let size: usize = parse_env("POOL_SIZE", "3")?;
        if size == 0 {
            return Err(RotatorError::InvalidConfig(
                "POOL_SIZE must be at least 1".into(),
            ));
        }
        // every pair needs two ports at once
        if (ports.end - ports.start) as usize / 2 < size {
            return Err(RotatorError::InvalidConfig(format!(
                "port range {}-{} is too small for {} pairs",
                ports.start, ports.end, size
            )));
        }

        Ok(Config {
            proxy: ProxyConfig {
                port: parse_env("PROXY_PORT", "8080")?,
                stats_port: (stats_port > 0).then_some(stats_port),
                max_conn: parse_env("PROXY_MAX_CONN", "256")?,
                balance: BalanceStrategy::from_str(&get_env_or("PROXY_BALANCE", "round_robin")),
            },
            pool: PoolConfig {
                size,
                max_lifetime: Duration::from_secs(parse_env("MAX_PROXY_TIME", "900")?),
                circuit_period: Duration::from_secs(parse_env("CIRCUIT_TIME", "120")?),
                settle: Duration::from_millis(parse_env("SETTLE_MS", "250")?),
                retry_backoff: Duration::from_millis(parse_env("RETRY_BACKOFF_MS", "500")?),
            },
            ports,
            reload: ReloadConfig {
                quiet_period: Duration::from_millis(parse_env("RELOAD_QUIET_MS", "2000")?),
                ceiling: Duration::from_millis(parse_env("RELOAD_CEILING_MS", "10000")?),
                handoff_grace: Duration::from_secs(parse_env("HANDOFF_GRACE_SECS", "30")?),
            },
            binaries: BinaryConfig {
                tor: get_env_or("TOR_BIN", "tor"),
                privoxy: get_env_or("PRIVOXY_BIN", "privoxy"),
                haproxy: get_env_or("HAPROXY_BIN", "haproxy"),
            },
            api: ApiServerConfig {
                enabled: get_env_or("API_ENABLED", "false").parse().unwrap_or(false),
                host: get_env_or("API_HOST", "127.0.0.1"),
                port: parse_env("API_PORT", "8081")?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
            work_dir: PathBuf::from(get_env_or("WORK_DIR", "/tmp/torotator")),
        })
    }

    /// Get the status API address
    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }

    /// Working directory of the reverse proxy
    pub fn haproxy_dir(&self) -> PathBuf {
        self.work_dir.join("haproxy")
    }
}

/// Parse an environment variable, falling back to a default
fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| RotatorError::InvalidConfig(format!("{} has an invalid value", key)))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "PROXY_PORT",
        "STATS_PORT",
        "PROXY_MAX_CONN",
        "PROXY_BALANCE",
        "POOL_SIZE",
        "PORT_RANGE_START",
        "PORT_RANGE_END",
        "MAX_PROXY_TIME",
        "CIRCUIT_TIME",
        "SETTLE_MS",
        "RETRY_BACKOFF_MS",
        "RELOAD_QUIET_MS",
        "RELOAD_CEILING_MS",
        "HANDOFF_GRACE_SECS",
        "TOR_BIN",
        "PRIVOXY_BIN",
        "HAPROXY_BIN",
        "API_ENABLED",
        "API_HOST",
        "API_PORT",
        "LOG_LEVEL",
        "LOG_FORMAT",
        "WORK_DIR",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.stats_port, None);
        assert_eq!(config.proxy.max_conn, 256);
        assert_eq!(config.proxy.balance, BalanceStrategy::RoundRobin);

        assert_eq!(config.pool.size, 3);
        assert_eq!(config.pool.max_lifetime, Duration::from_secs(900));
        assert_eq!(config.pool.settle, Duration::from_millis(250));

        assert_eq!(config.ports, PortRangeConfig { start: 30000, end: 65535 });
        assert_eq!(config.reload.quiet_period, Duration::from_secs(2));
        assert_eq!(config.reload.ceiling, Duration::from_secs(10));

        assert_eq!(config.binaries.haproxy, "haproxy");
        assert!(!config.api.enabled);
        assert_eq!(config.haproxy_dir(), PathBuf::from("/tmp/torotator/haproxy"));
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "9050");
        env::set_var("STATS_PORT", "9051");
        env::set_var("PROXY_BALANCE", "least_conn");
        env::set_var("POOL_SIZE", "5");
        env::set_var("PORT_RANGE_START", "40000");
        env::set_var("PORT_RANGE_END", "40100");
        env::set_var("RELOAD_QUIET_MS", "500");
        env::set_var("API_ENABLED", "true");
        env::set_var("API_PORT", "9999");
        env::set_var("WORK_DIR", "/var/tmp/rot");

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.port, 9050);
        assert_eq!(config.proxy.stats_port, Some(9051));
        assert_eq!(config.proxy.balance, BalanceStrategy::LeastConnections);
        assert_eq!(config.pool.size, 5);
        assert_eq!(config.ports, PortRangeConfig { start: 40000, end: 40100 });
        assert_eq!(config.reload.quiet_period, Duration::from_millis(500));
        assert!(config.api.enabled);
        assert_eq!(config.api_addr(), "127.0.0.1:9999");
        assert_eq!(config.haproxy_dir(), PathBuf::from("/var/tmp/rot/haproxy"));
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotatorError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_inverted_range() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PORT_RANGE_START", "40000");
        env::set_var("PORT_RANGE_END", "39000");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotatorError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_range_smaller_than_pool() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_SIZE", "4");
        env::set_var("PORT_RANGE_START", "40000");
        env::set_var("PORT_RANGE_END", "40006");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotatorError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_empty_pool() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("POOL_SIZE", "0");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RotatorError::InvalidConfig(_)));
    }
}
