//! Gateway configuration.

use crate::error::{GatewayError, Result};
use ios_core::{IosError, IosResult, Validatable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// How inbound bytes are split into frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Newline-delimited; partial lines are buffered across reads
    #[default]
    Line,
    /// One frame per socket read
    Read,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line => f.write_str("line"),
            Self::Read => f.write_str("read"),
        }
    }
}

/// Listener and connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// IP address to listen on
    pub listen_address: String,
    /// Port to listen on; 0 picks a free port
    pub listen_port: u16,
    /// Per-connection read buffer size in bytes
    pub buffer_size: usize,
    /// Bound on a single outbound write
    pub send_timeout_ms: u64,
    /// Connections beyond this are refused
    pub max_connections: usize,
    /// Enable TCP keep-alive on accepted sockets
    pub enable_keep_alive: bool,
    /// TCP keep-alive idle time and retry interval
    pub keep_alive_interval_ms: u64,
    /// Retry binding after a failure
    pub enable_auto_restart: bool,
    /// Delay between bind attempts
    pub restart_interval_ms: u64,
    /// Bind retries after the first attempt
    pub max_retries: u32,
    /// Delay before accepting again after an accept error
    pub accept_retry_delay_ms: u64,
    /// Frame splitting mode
    pub framing: Framing,
    /// Longest buffered line before it is flushed as a frame
    pub max_frame_len: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 8080,
            buffer_size: 1024,
            send_timeout_ms: 5000,
            max_connections: 10,
            enable_keep_alive: true,
            keep_alive_interval_ms: 30000,
            enable_auto_restart: true,
            restart_interval_ms: 5000,
            max_retries: 3,
            accept_retry_delay_ms: 1000,
            framing: Framing::Line,
            max_frame_len: 65536,
            event_capacity: 1024,
        }
    }
}

impl GatewayConfig {
    /// Config listening on an ephemeral loopback port, as used by tests
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 0,
            ..Self::default()
        }
    }

    /// Parsed listen address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_address
            .trim()
            .parse()
            .map_err(|e| GatewayError::InvalidAddress(format!("{}: {e}", self.listen_address)))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    /// Outbound write bound
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Keep-alive idle/interval
    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Delay between bind attempts
    #[must_use]
    pub fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.restart_interval_ms)
    }

    /// Delay after an accept error
    #[must_use]
    pub fn accept_retry_delay(&self) -> Duration {
        Duration::from_millis(self.accept_retry_delay_ms)
    }

    /// One-line description for logs
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Listen: {}:{}, MaxConn: {}, Buffer: {}B",
            self.listen_address, self.listen_port, self.max_connections, self.buffer_size
        )
    }
}

impl Validatable for GatewayConfig {
    fn validate(&self) -> IosResult<()> {
        if self.listen_address.trim().is_empty() {
            return Err(IosError::config("Listen address is empty"));
        }
        if self.buffer_size == 0 {
            return Err(IosError::config("Buffer size must be positive"));
        }
        if self.send_timeout_ms == 0 {
            return Err(IosError::config("Send timeout must be positive"));
        }
        if self.max_connections == 0 {
            return Err(IosError::config("Max connections must be positive"));
        }
        if self.enable_keep_alive && self.keep_alive_interval_ms == 0 {
            return Err(IosError::config("Keep-alive interval must be positive"));
        }
        if self.enable_auto_restart && self.restart_interval_ms == 0 {
            return Err(IosError::config("Restart interval must be positive"));
        }
        if self.max_frame_len == 0 || self.event_capacity == 0 {
            return Err(IosError::config("Frame length and event capacity must be positive"));
        }
        self.socket_addr().map_err(IosError::from)?;
        Ok(())
    }
}
