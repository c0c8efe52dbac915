//! Transports: how a container turns a target ID into a connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::identity::Id;

use super::framed::FramedConnection;
use super::link::Dialer;
use super::memory::MemoryNetwork;
use super::tcp::TcpDialer;
use super::Connection;

/// Container-facing connection factory.
pub trait Transport: Send + Sync + 'static {
    /// Map a target ID to the address passed to [`Connection::connect`].
    ///
    /// Defaults to the ID's external form (`namespace:value`).
    fn resolve(&self, target: &Id) -> Result<String, ConnectionError> {
        Ok(target.to_external_form())
    }

    /// Create a fresh, unopened connection.
    fn create_connection(&self) -> Arc<dyn Connection>;
}

/// Transport handing out [`FramedConnection`]s over a [`Dialer`].
pub struct FramedTransport<D: Dialer> {
    dialer: Arc<D>,
    config: ConnectionConfig,
}

impl<D: Dialer> FramedTransport<D> {
    /// Create a transport.
    pub fn new(dialer: D, config: ConnectionConfig) -> Self {
        Self {
            dialer: Arc::new(dialer),
            config,
        }
    }

    /// The underlying dialer.
    pub fn dialer(&self) -> &D {
        &self.dialer
    }
}

impl<D: Dialer> std::fmt::Debug for FramedTransport<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl<D: Dialer> Transport for FramedTransport<D> {
    fn create_connection(&self) -> Arc<dyn Connection> {
        Arc::new(FramedConnection::new(
            self.dialer.clone(),
            self.config.clone(),
        ))
    }
}

/// Transport over a [`MemoryNetwork`]. Targets resolve to their external
/// form, so a group at `group:42` is reached by binding `"group:42"`.
pub type MemoryTransport = FramedTransport<MemoryNetwork>;

impl MemoryTransport {
    /// Create a memory transport with default connection settings.
    pub fn memory(network: MemoryNetwork) -> Self {
        Self::new(network, ConnectionConfig::default())
    }
}

/// Transport over TCP. Target IDs name a socket address (`host:port`), for
/// example `tcp:127.0.0.1:4500` built in a namespace called `tcp`.
#[derive(Debug)]
pub struct TcpTransport {
    inner: FramedTransport<TcpDialer>,
}

impl TcpTransport {
    /// Create a TCP transport.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            inner: FramedTransport::new(TcpDialer::new(&config), config),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl Transport for TcpTransport {
    fn resolve(&self, target: &Id) -> Result<String, ConnectionError> {
        let name = target.name();
        name.parse::<SocketAddr>()
            .map(|addr| addr.to_string())
            .map_err(|_| {
                ConnectionError::Instantiation(format!("{} is not a socket address", name))
            })
    }

    fn create_connection(&self) -> Arc<dyn Connection> {
        self.inner.create_connection()
    }
}
