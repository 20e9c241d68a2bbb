//! Connection and listener configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use controlws::ConnectionConfig;
//!
//! let config = ConnectionConfig::new()
//!     .with_keepalive_interval(Duration::from_secs(10))
//!     .with_request_timeout(Duration::from_secs(30));
//! config.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default keepalive period.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(5000);

/// Default silence tolerated on top of one keepalive period.
pub const DEFAULT_GRACE_MARGIN: Duration = Duration::from_millis(1500);

/// Default endpoint path served by [`ConnectionListener`](super::ConnectionListener).
pub const DEFAULT_ENDPOINT_PATH: &str = "/controlWS";

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[inline]
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// ConnectionConfig
// ============================================================================

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Period between keepalive frames.
    pub keepalive_interval: Duration,

    /// Silence tolerated beyond one keepalive period before the socket is
    /// force-closed.
    pub grace_margin: Duration,

    /// Timeout applied by [`Connection::send_request`](super::Connection::send_request).
    /// `None` waits until a response arrives or the connection closes.
    pub request_timeout: Option<Duration>,

    /// Upper bound on in-flight requests. `None` is unbounded.
    pub max_pending_requests: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionConfig {
    /// Creates a config with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            grace_margin: DEFAULT_GRACE_MARGIN,
            request_timeout: None,
            max_pending_requests: None,
        }
    }

    /// Sets the keepalive period.
    #[inline]
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Sets the grace margin.
    #[inline]
    #[must_use]
    pub fn with_grace_margin(mut self, margin: Duration) -> Self {
        self.grace_margin = margin;
        self
    }

    /// Sets the default request timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Caps the number of in-flight requests.
    #[inline]
    #[must_use]
    pub fn with_max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = Some(max);
        self
    }

    /// Silence after which the peer is considered dead.
    #[inline]
    #[must_use]
    pub fn silence_timeout(&self) -> Duration {
        self.keepalive_interval + self.grace_margin
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero keepalive interval, a zero request
    /// timeout or a zero pending-request cap.
    pub fn validate(&self) -> Result<()> {
        if self.keepalive_interval.is_zero() {
            return Err(Error::config("keepalive interval must be greater than zero"));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("request timeout must be greater than zero"));
        }
        if self.max_pending_requests == Some(0) {
            return Err(Error::config("max pending requests must be greater than zero"));
        }
        Ok(())
    }
}

// ============================================================================
// ListenerConfig
// ============================================================================

/// Settings for the serving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Address to bind.
    pub ip: IpAddr,

    /// Port to bind (0 for random).
    pub port: u16,

    /// Only upgrade requests for this path are accepted.
    pub path: String,

    /// Settings for every accepted connection.
    pub connection: ConnectionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            path: DEFAULT_ENDPOINT_PATH.to_string(),
            connection: ConnectionConfig::new(),
        }
    }
}

impl ListenerConfig {
    /// Creates a config with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bind address.
    #[inline]
    #[must_use]
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    /// Sets the bind port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the endpoint path.
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the per-connection config.
    #[inline]
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the path does not start with `/` or the
    /// connection config is invalid.
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::config(format!(
                "endpoint path must start with '/': {}",
                self.path
            )));
        }
        self.connection.validate()
    }
}

// ============================================================================
// Tests
// ============================================================================
