use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub http_port: u16,
    pub socks5_port: u16,
    pub api_port: u16,
    /// Root of the durable state layout: `ca/`, `certs/`, `sslkeys.log`,
    /// `api.addr` and `data/`.
    pub state_dir: PathBuf,
    /// `scheme://[user:pass@]host:port`; `http`, `https`, `socks5` and
    /// `socks` schemes are recognised.
    pub upstream_proxy: Option<String>,
    pub enable_http_parsing: bool,
    /// `None` disables the on-disk record log; the in-memory tail remains.
    pub record_path: Option<PathBuf>,
    pub record_cache_size: usize,
    /// Cap on the management API's recent-records fetch.
    pub recent_fetch_max: usize,
    /// Serialized `FileDescriptorSet` priming the message registry.
    pub descriptor_set_path: Option<PathBuf>,
    pub max_http_head_bytes: usize,
    pub dial_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let state_dir = default_state_dir();
        Self {
            listen_addr: "127.0.0.1".to_string(),
            http_port: 8080,
            socks5_port: 1080,
            api_port: 8888,
            record_path: Some(state_dir.join("data").join("records.jsonl")),
            state_dir,
            upstream_proxy: None,
            enable_http_parsing: true,
            record_cache_size: 10_000,
            recent_fetch_max: 1000,
            descriptor_set_path: None,
            max_http_head_bytes: 64 * 1024,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "listen_addr must not be empty".to_string(),
            ));
        }
        if self.record_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "record_cache_size must be greater than zero".to_string(),
            ));
        }
        if self.recent_fetch_max == 0 {
            return Err(ConfigError::Invalid(
                "recent_fetch_max must be greater than zero".to_string(),
            ));
        }
        if self.max_http_head_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_http_head_bytes must be greater than zero".to_string(),
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "dial_timeout must be greater than zero".to_string(),
            ));
        }

        let mut ports = [self.http_port, self.socks5_port, self.api_port];
        ports.sort_unstable();
        if ports.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(
                "http_port, socks5_port and api_port must be distinct".to_string(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.state_dir.join("data")
    }

    pub fn key_log_path(&self) -> PathBuf {
        self.state_dir.join("sslkeys.log")
    }

    pub fn api_addr_path(&self) -> PathBuf {
        self.state_dir.join("api.addr")
    }
}

fn default_state_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".rpctap"),
        _ => PathBuf::from(".rpctap"),
    }
}

#[cfg(test)]
mod tests {
    use super::ProxyConfig;

    #[test]
    fn default_config_is_valid() {
        ProxyConfig::default().validate().expect("default config");
    }

    #[test]
    fn rejects_colliding_ports() {
        let config = ProxyConfig {
            http_port: 9000,
            socks5_port: 9000,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_cache() {
        let config = ProxyConfig {
            record_cache_size: 0,
            ..ProxyConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn derived_paths_hang_off_state_dir() {
        let config = ProxyConfig {
            state_dir: "/tmp/tap-state".into(),
            ..ProxyConfig::default()
        };
        assert_eq!(config.key_log_path(), std::path::Path::new("/tmp/tap-state/sslkeys.log"));
        assert_eq!(config.api_addr_path(), std::path::Path::new("/tmp/tap-state/api.addr"));
        assert_eq!(config.data_dir(), std::path::Path::new("/tmp/tap-state/data"));
    }
}
