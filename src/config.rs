//! Configuration loading and validation

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration, loaded from a TOML file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheFileConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub invalidator: InvalidatorConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheFileConfig {
    /// Entry lifetime in minutes
    #[serde(default = "default_ttl")]
    pub ttl: u64,

    /// Sweeper interval in minutes (must be greater than 0)
    #[serde(default = "default_clean_frequency")]
    pub clean_frequency: u64,

    /// Per-shard entry count hint
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Largest accepted entry in bytes
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: usize,

    /// Total cache budget in megabytes
    #[serde(default = "default_hard_max_cache_size")]
    pub hard_max_cache_size: usize,
}

impl Default for CacheFileConfig {
    fn default() -> Self {
        CacheFileConfig {
            ttl: default_ttl(),
            clean_frequency: default_clean_frequency(),
            max_entries: default_max_entries(),
            max_entry_size: default_max_entry_size(),
            hard_max_cache_size: default_hard_max_cache_size(),
        }
    }
}

impl CacheFileConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl * 60)
    }

    pub fn clean_frequency(&self) -> Duration {
        Duration::from_secs(self.clean_frequency * 60)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Listen address (host:port)
    #[serde(default = "default_proxy_addr")]
    pub addr: String,

    /// Origin addresses, selected round-robin (must not be empty)
    #[serde(default)]
    pub backend_addrs: Vec<String>,

    /// Response mutations applied to every backend reply
    #[serde(default)]
    pub response: ResponseConfig,

    /// Conditions that forbid cache admission
    #[serde(default)]
    pub nocache: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            addr: default_proxy_addr(),
            backend_addrs: Vec::new(),
            response: ResponseConfig::default(),
            nocache: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResponseConfig {
    #[serde(default)]
    pub headers: HeadersConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HeadersConfig {
    #[serde(default)]
    pub set: Vec<HeaderEntry>,

    #[serde(default)]
    pub unset: Vec<HeaderEntry>,
}

/// One configured header mutation. `value` may be a literal or a
/// `$(req.header::NAME)` reference; `when` gates the mutation on a rule.
#[derive(Debug, Deserialize, Clone)]
pub struct HeaderEntry {
    pub name: String,

    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub when: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InvalidatorConfig {
    /// Admin listen address (host:port)
    #[serde(default = "default_invalidator_addr")]
    pub addr: String,

    /// Upper bound on concurrent invalidation workers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for InvalidatorConfig {
    fn default() -> Self {
        InvalidatorConfig {
            addr: default_invalidator_addr(),
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// One of: debug, info, warn, error, fatal
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "console" or a file path
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            output: default_log_output(),
        }
    }
}

impl LogConfig {
    /// Directive for the tracing env filter.
    pub fn filter_directive(&self) -> String {
        let level = match self.level.as_str() {
            // No fatal level in tracing; errors are the closest.
            "fatal" => "error",
            other => other,
        };
        format!("cachegate={}", level)
    }

    pub fn is_debug(&self) -> bool {
        self.level == "debug"
    }

    pub fn is_console(&self) -> bool {
        self.output == "console"
    }
}

fn default_ttl() -> u64 {
    10
}

fn default_clean_frequency() -> u64 {
    5
}

fn default_max_entries() -> usize {
    1024
}

fn default_max_entry_size() -> usize {
    512 * 1024
}

fn default_hard_max_cache_size() -> usize {
    64
}

fn default_proxy_addr() -> String {
    "0.0.0.0:6081".to_string()
}

fn default_invalidator_addr() -> String {
    "0.0.0.0:6082".to_string()
}

fn default_max_workers() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "console".to_string()
}

const LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error", "fatal"];

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.cache.ttl == 0 {
            errors.push("cache.ttl must be greater than 0".to_string());
        }
        if self.cache.clean_frequency == 0 {
            errors.push("cache.clean_frequency must be greater than 0".to_string());
        }
        if self.cache.hard_max_cache_size == 0 {
            errors.push("cache.hard_max_cache_size must be greater than 0".to_string());
        }

        if self.proxy.backend_addrs.is_empty() {
            errors.push("proxy.backend_addrs must not be empty".to_string());
        }
        if self.proxy.addr.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("proxy.addr '{}' is not a valid address", self.proxy.addr));
        }

        if self.invalidator.max_workers == 0 {
            errors.push("invalidator.max_workers must be greater than 0".to_string());
        }
        if self
            .invalidator
            .addr
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            errors.push(format!(
                "invalidator.addr '{}' is not a valid address",
                self.invalidator.addr
            ));
        }

        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            errors.push(format!("log.level '{}' is not recognized", self.log.level));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.proxy.addr = "127.0.0.1:6081".to_string();
        config.invalidator.addr = "127.0.0.1:6082".to_string();
        config.proxy.backend_addrs = vec!["127.0.0.1:9000".to_string()];
        config
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            ttl = 30
            clean_frequency = 2
            max_entries = 500
            max_entry_size = 20000
            hard_max_cache_size = 128

            [proxy]
            addr = "0.0.0.0:8000"
            backend_addrs = ["127.0.0.1:9990", "127.0.0.1:9991"]
            nocache = ["$(host) == 'localhost'"]

            [[proxy.response.headers.set]]
            name = "X-Gate"
            value = "true"
            when = "$(resp.header::X-Data) == '1'"

            [[proxy.response.headers.unset]]
            name = "X-Data"

            [invalidator]
            addr = "0.0.0.0:8001"
            max_workers = 3

            [log]
            level = "debug"
            output = "console"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.ttl(), Duration::from_secs(30 * 60));
        assert_eq!(config.cache.clean_frequency, 2);
        assert_eq!(config.proxy.backend_addrs.len(), 2);
        assert_eq!(config.proxy.nocache.len(), 1);
        assert_eq!(config.proxy.response.headers.set[0].name, "X-Gate");
        assert_eq!(
            config.proxy.response.headers.set[0].when.as_deref(),
            Some("$(resp.header::X-Data) == '1'")
        );
        assert_eq!(config.proxy.response.headers.unset[0].value, None);
        assert_eq!(config.invalidator.max_workers, 3);
        assert!(config.log.is_debug());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.ttl, 10);
        assert_eq!(config.cache.clean_frequency, 5);
        assert_eq!(config.proxy.addr, "0.0.0.0:6081");
        assert_eq!(config.invalidator.max_workers, 5);
        assert_eq!(config.log.level, "info");
        assert!(config.log.is_console());
    }

    #[test]
    fn test_validate_requires_backends() {
        let mut config = valid_config();
        config.proxy.backend_addrs.clear();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("backend_addrs"));
    }

    #[test]
    fn test_validate_rejects_zero_clean_frequency() {
        let mut config = valid_config();
        config.cache.clean_frequency = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("clean_frequency"));
    }

    #[test]
    fn test_validate_rejects_zero_workers_and_bad_level() {
        let mut config = valid_config();
        config.invalidator.max_workers = 0;
        config.log.level = "verbose".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_workers"));
        assert!(err.contains("log.level"));
    }

    #[test]
    fn test_validate_rejects_bad_addr() {
        let mut config = valid_config();
        config.proxy.addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_filter_directive_maps_fatal() {
        let mut log = LogConfig::default();
        assert_eq!(log.filter_directive(), "cachegate=info");
        log.level = "fatal".to_string();
        assert_eq!(log.filter_directive(), "cachegate=error");
    }
}
