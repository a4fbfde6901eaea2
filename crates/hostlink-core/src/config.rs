//! Centralized configuration for the hostlink bus.
//!
//! Constants live on unit structs; runtime settings are plain structs with
//! builder-style setters whose defaults come from those constants.

use crate::backoff::{FixedDelay, ReconnectPolicy};
use crate::error::{HostlinkError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Bus-wide defaults.
pub struct BusConfig;

impl BusConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 8090;

    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

    // Reconnect
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// WebSocket URL of a host on the default address.
    pub fn default_url() -> String {
        format!("ws://{}:{}/", Self::DEFAULT_HOST, Self::DEFAULT_PORT)
    }
}

/// Client-side settings for a connection manager.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the host.
    pub url: String,
    /// Deadline applied to every request; `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Delay policy between reconnect attempts.
    pub reconnect: Arc<dyn ReconnectPolicy>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: BusConfig::default_url(),
            request_timeout: Some(BusConfig::REQUEST_TIMEOUT),
            connect_timeout: BusConfig::CONNECT_TIMEOUT,
            reconnect: Arc::new(FixedDelay::new(BusConfig::RECONNECT_DELAY)),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: impl ReconnectPolicy + 'static) -> Self {
        self.reconnect = Arc::new(policy);
        self
    }
}

/// Host-side listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port to bind; `0` picks a free port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: BusConfig::DEFAULT_HOST.to_string(),
            port: BusConfig::DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback on an OS-assigned port.
    pub fn ephemeral() -> Self {
        Self::new(BusConfig::DEFAULT_HOST, 0)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| HostlinkError::Config {
                message: format!("Invalid bind address {}:{}: {}", self.host, self.port, e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let client = ClientConfig::default();
        assert_eq!(client.url, "ws://127.0.0.1:8090/");
        assert_eq!(client.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(client.reconnect.delay(0), Duration::from_secs(5));

        let server = ServerConfig::default();
        assert_eq!(server.port, 8090);
        assert_eq!(server.bind_addr().unwrap().to_string(), "127.0.0.1:8090");
    }

    #[test]
    fn test_builder_setters() {
        let client = ClientConfig::new("ws://localhost:9000/")
            .with_request_timeout(None)
            .with_reconnect_policy(FixedDelay::new(Duration::from_millis(10)));
        assert!(client.request_timeout.is_none());
        assert_eq!(client.reconnect.delay(3), Duration::from_millis(10));
    }

    #[test]
    fn test_bad_host_is_config_error() {
        let err = ServerConfig::new("not a host", 1).bind_addr().unwrap_err();
        assert!(matches!(err, HostlinkError::Config { .. }));
    }
}
