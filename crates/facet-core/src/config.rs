//! Centralized configuration for the FACET transport.
//!
//! Defaults live as associated constants on [`TransportConfig`]. Runtime
//! settings are plain structs with builder methods, optionally loaded from
//! `FACET_*` environment variables.

use crate::transport::ReconnectPolicy;
use crate::{FacetError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Transport-wide defaults and limits.
pub struct TransportConfig;

impl TransportConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const DEFAULT_PORT: u16 = 3000;

    /// Largest payload accepted in one frame (16 MiB).
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

    // Server limits
    pub const MAX_CONNECTIONS: usize = 100;
    pub const MAX_IN_FLIGHT_PER_CONNECTION: usize = 50;
    pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

    // Client timing
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Capacity of the client lifecycle event channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}

/// Settings for [`crate::RpcServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port to bind (0 = OS-assigned).
    pub port: u16,
    pub max_connections: usize,
    pub max_in_flight_per_connection: usize,
    pub handler_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: TransportConfig::DEFAULT_HOST.to_string(),
            port: TransportConfig::DEFAULT_PORT,
            max_connections: TransportConfig::MAX_CONNECTIONS,
            max_in_flight_per_connection: TransportConfig::MAX_IN_FLIGHT_PER_CONNECTION,
            handler_timeout: TransportConfig::HANDLER_TIMEOUT,
            max_message_size: TransportConfig::MAX_MESSAGE_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from `FACET_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("FACET_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, "FACET_PORT")? {
            config.port = port;
        }
        if let Some(max) = parse_var(&lookup, "FACET_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(max) = parse_var(&lookup, "FACET_MAX_IN_FLIGHT")? {
            config.max_in_flight_per_connection = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FACET_HANDLER_TIMEOUT_MS")? {
            config.handler_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight_per_connection = max;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// `host:port` string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(config_error("max_connections must be at least 1"));
        }
        if self.max_in_flight_per_connection == 0 {
            return Err(config_error("max_in_flight_per_connection must be at least 1"));
        }
        if self.handler_timeout.is_zero() {
            return Err(config_error("handler_timeout must be positive"));
        }
        Ok(())
    }
}

/// Settings for [`crate::RpcClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout applied to calls that do not specify one.
    pub default_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: TransportConfig::CALL_TIMEOUT,
            connect_timeout: TransportConfig::CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            max_message_size: TransportConfig::MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from `FACET_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, "FACET_REQUEST_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, "FACET_RECONNECT_ATTEMPTS")? {
            config.reconnect = config.reconnect.with_max_attempts(attempts);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FACET_RECONNECT_BASE_DELAY_MS")? {
            config.reconnect = config.reconnect.with_base_delay(Duration::from_millis(ms));
        }
        if config.default_timeout.is_zero() {
            return Err(config_error("request timeout must be positive"));
        }
        Ok(config)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| config_error(format!("invalid value for {}: {:?} ({})", name, raw, e))),
    }
}

fn config_error(message: impl Into<String>) -> FacetError {
    FacetError::Config {
        message: message.into(),
    }
}
