//! Configuration for connections, client containers and group servers.

use std::time::Duration;

use crate::error::ConfigError;
use crate::wire::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for a single framed connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Largest frame accepted or sent, in bytes.
    pub max_frame_size: usize,

    /// How long `disconnect` keeps flushing already-queued async frames.
    pub drain_timeout: Duration,

    /// Interval between liveness pings.
    ///
    /// `Duration::ZERO` disables ping monitoring.
    pub ping_interval: Duration,

    /// How long to wait for a pong before failing the connection.
    pub ping_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            drain_timeout: Duration::from_secs(1),
            ping_interval: Duration::ZERO,
            ping_timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for low-latency local networking.
    pub fn local_network() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            drain_timeout: Duration::from_millis(100),
            ping_interval: Duration::from_millis(500),
            ping_timeout: Duration::from_secs(1),
        }
    }

    /// Enable ping monitoring with the given interval and timeout.
    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Reject zero sizes and timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size == 0 {
            return Err(ConfigError::ZeroLimit("max_frame_size"));
        }
        if self.drain_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("drain_timeout"));
        }
        if !self.ping_interval.is_zero() && self.ping_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("ping_timeout"));
        }
        Ok(())
    }
}

/// Configuration for a client [`Container`](crate::Container).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use cohort::ContainerConfig;
///
/// let config = ContainerConfig::builder()
///     .connect_timeout(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// assert_eq!(config.join_timeout(), Duration::from_secs(5));
/// ```
#[derive(Clone, Debug)]
pub struct ContainerConfig {
    connect_timeout: Duration,
    join_timeout: Option<Duration>,
    leave_on_disconnect: bool,
    connection: ConnectionConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            join_timeout: None,
            leave_on_disconnect: true,
            connection: ConnectionConfig::default(),
        }
    }
}

impl ContainerConfig {
    /// Start building a container configuration.
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::default()
    }

    /// Overall bound on `connect`, handshake included.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Bound on the join request round trip. Defaults to the connect timeout.
    pub fn join_timeout(&self) -> Duration {
        self.join_timeout.unwrap_or(self.connect_timeout)
    }

    /// Whether `disconnect` sends a `Leave` to the group first.
    pub fn leave_on_disconnect(&self) -> bool {
        self.leave_on_disconnect
    }

    /// Settings for the connections this container opens.
    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }
}

/// Builder for [`ContainerConfig`].
#[derive(Clone, Debug, Default)]
pub struct ContainerConfigBuilder {
    connect_timeout: Option<Duration>,
    join_timeout: Option<Duration>,
    leave_on_disconnect: Option<bool>,
    connection: Option<ConnectionConfig>,
}

impl ContainerConfigBuilder {
    /// Set the overall connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the join request timeout.
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = Some(timeout);
        self
    }

    /// Set whether `disconnect` sends a `Leave` first.
    pub fn leave_on_disconnect(mut self, leave: bool) -> Self {
        self.leave_on_disconnect = Some(leave);
        self
    }

    /// Set the connection configuration.
    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<ContainerConfig, ConfigError> {
        let defaults = ContainerConfig::default();
        let config = ContainerConfig {
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            join_timeout: self.join_timeout,
            leave_on_disconnect: self
                .leave_on_disconnect
                .unwrap_or(defaults.leave_on_disconnect),
            connection: self.connection.unwrap_or(defaults.connection),
        };
        if config.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("connect_timeout"));
        }
        if config.join_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroTimeout("join_timeout"));
        }
        config.connection.validate()?;
        Ok(config)
    }
}

/// Configuration for a [`GroupServer`](crate::GroupServer).
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Admit at most this many members, the server excluded.
    pub max_members: Option<usize>,

    /// Settings for accepted peer connections.
    pub connection: ConnectionConfig,
}

impl ServerConfig {
    /// Limit the number of admitted members.
    pub fn with_max_members(mut self, max_members: usize) -> Self {
        self.max_members = Some(max_members);
        self
    }

    /// Reject zero limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_members == Some(0) {
            return Err(ConfigError::ZeroLimit("max_members"));
        }
        self.connection.validate()
    }
}
