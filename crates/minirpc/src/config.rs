//! Connection set configuration.
//!
//! Every connection in a set shares one [`SetConfig`]. The defaults match
//! what a long-lived LAN service wants: 1 MiB payloads, Nagle disabled and
//! TCP keepalive probing after two idle hours.

use std::net::TcpStream;
use std::time::Duration;

use minirpc_common::{MinirpcError, Result, DEFAULT_MAX_PAYLOAD_LEN};
use socket2::{SockRef, TcpKeepalive};

/// TCP keepalive probing parameters.
///
/// # Default Configuration
///
/// - `idle`: 7200 seconds before the first probe
/// - `interval`: 75 seconds between probes
/// - `retries`: 9 unanswered probes before the connection is dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub interval: Duration,
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(7200),
            interval: Duration::from_secs(75),
            retries: 9,
        }
    }
}

/// Configuration shared by all connections of a [`ConnectionSet`](crate::ConnectionSet).
///
/// # Fields
///
/// - `max_payload_len`: Largest payload accepted or sent (default: 1 MiB)
/// - `max_pending`: Outstanding two-way calls allowed per connection (default: 8192)
/// - `max_queued_frames`: Frames waiting to be written per connection before
///   senders get [`MinirpcError::QueueFull`] (default: 4096)
/// - `connect_timeout`: Time allowed for an outbound TCP connect (default: 5 seconds)
/// - `tcp_nodelay`: Disable Nagle's algorithm on TCP sockets (default: true)
/// - `keepalive`: TCP keepalive settings, `None` leaves the OS default
/// - `read_buffer_size`: Initial capacity of each connection's inbound buffer (default: 16 KiB)
/// - `shutdown_timeout`: Time [`ConnectionSet::shutdown`](crate::ConnectionSet::shutdown)
///   waits for queued frames to flush before forcing connections closed (default: 5 seconds)
///
/// # Example
///
/// ```
/// use minirpc::SetConfig;
/// use std::time::Duration;
///
/// let config = SetConfig::new()
///     .with_max_payload_len(64 * 1024)
///     .with_connect_timeout(Duration::from_secs(1))
///     .without_keepalive();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetConfig {
    pub max_payload_len: usize,
    pub max_pending: usize,
    pub max_queued_frames: usize,
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
    pub keepalive: Option<KeepaliveConfig>,
    pub read_buffer_size: usize,
    pub shutdown_timeout: Duration,
}

impl Default for SetConfig {
    fn default() -> Self {
        Self {
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            max_pending: 8192,
            max_queued_frames: 4096,
            connect_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
            keepalive: Some(KeepaliveConfig::default()),
            read_buffer_size: 16 * 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl SetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_payload_len(mut self, len: usize) -> Self {
        self.max_payload_len = len;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    pub fn with_max_queued_frames(mut self, max: usize) -> Self {
        self.max_queued_frames = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn without_keepalive(mut self) -> Self {
        self.keepalive = None;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`MinirpcError::InvalidArgument`] if:
    /// - `max_payload_len` is zero or does not fit the 32-bit length field
    /// - `max_pending` or `max_queued_frames` is zero
    /// - `connect_timeout` is zero
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_len == 0 {
            return Err(MinirpcError::InvalidArgument(
                "max_payload_len must be greater than zero".to_string(),
            ));
        }
        if u32::try_from(self.max_payload_len).is_err() {
            return Err(MinirpcError::InvalidArgument(format!(
                "max_payload_len must fit in 32 bits (got {})",
                self.max_payload_len
            )));
        }
        if self.max_pending == 0 {
            return Err(MinirpcError::InvalidArgument(
                "max_pending must be greater than zero".to_string(),
            ));
        }
        if self.max_queued_frames == 0 {
            return Err(MinirpcError::InvalidArgument(
                "max_queued_frames must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(MinirpcError::InvalidArgument(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies the socket options to a connected TCP stream.
    pub(crate) fn apply_to(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.tcp_nodelay)?;
        if let Some(keepalive) = &self.keepalive {
            let params = TcpKeepalive::new().with_time(keepalive.idle);
            #[cfg(any(
                target_os = "linux",
                target_os = "android",
                target_os = "macos",
                target_os = "freebsd"
            ))]
            let params = params
                .with_interval(keepalive.interval)
                .with_retries(keepalive.retries);
            SockRef::from(stream).set_tcp_keepalive(&params)?;
        }
        Ok(())
    }
}
