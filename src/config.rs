//! Service configuration.
//!
//! `ServiceConfig` is plain data: embedding code builds it directly or
//! deserializes it from the `[service]` table of a TOML file. The service
//! itself never reads files or the environment.

use crate::error::{Result, ServiceError};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Tunables for one service instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Interface to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on how long the event loop waits for readiness.
    /// Bounds how quickly a stop request is observed.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Longest line accepted before the connection is dropped
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// Readiness events collected per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Accepted connections waiting for the event loop to pick them up
    #[serde(default = "default_accept_queue")]
    pub accept_queue: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_line_length: default_max_line_length(),
            event_capacity: default_event_capacity(),
            backlog: default_backlog(),
            accept_queue: default_accept_queue(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_max_line_length() -> usize {
    64 * 1024 // 64 KB
}

fn default_event_capacity() -> usize {
    1024
}

fn default_backlog() -> i32 {
    1024
}

fn default_accept_queue() -> usize {
    128
}

impl ServiceConfig {
    /// Default configuration listening on `port` on all interfaces.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn max_line_length(mut self, len: usize) -> Self {
        self.max_line_length = len;
        self
    }

    pub fn poll_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Resolve `host:port` into the address to bind.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.host, self.port);
        target.to_socket_addrs()
            .map_err(|_| ServiceError::InvalidAddress(target.clone()))?
            .next()
            .ok_or(ServiceError::InvalidAddress(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7000);
        assert_eq!(config.poll_timeout_duration(), Duration::from_secs(1));
        assert_eq!(config.max_line_length, 64 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            host = "127.0.0.1"
            port = 9000
            poll_timeout_ms = 250
        "#;

        let config: ServiceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.poll_timeout_ms, 250);
        // Unspecified fields fall back to defaults
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.accept_queue, 128);
    }

    #[test]
    fn test_builder_helpers() {
        let config = ServiceConfig::with_port(0)
            .host("127.0.0.1")
            .poll_timeout(Duration::from_millis(50))
            .max_line_length(16);
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.poll_timeout_ms, 50);
        assert_eq!(config.max_line_length, 16);
    }

    #[test]
    fn test_invalid_address() {
        let config = ServiceConfig::with_port(1).host("");
        assert!(matches!(
            config.socket_addr(),
            Err(ServiceError::InvalidAddress(_))
        ));
    }
}
