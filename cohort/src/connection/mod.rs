//! Connection abstraction and its implementations.
//!
//! A [`Connection`] carries opaque payloads to one remote endpoint, either
//! fire-and-forget ([`Connection::send_asynch`]) or as a request awaiting a
//! reply ([`Connection::send_synch`]). Inbound traffic and the failure
//! notification reach [`ConnectionListener`]s on the connection's reader
//! task.
//!
//! [`FramedConnection`] implements the contract over any [`Link`], and a
//! [`Transport`] hands containers fresh connections for a target ID.

mod correlation;
mod frame;
mod framed;
mod link;
mod memory;
mod tcp;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConnectionError;

pub use frame::{CorrelationId, Frame, FrameKind, FRAME_HEADER_SIZE};
pub use framed::FramedConnection;
pub use link::{Acceptor, Dialer, FrameReader, FrameWriter, Link};
pub use memory::{MemoryAcceptor, MemoryNetwork};
pub use tcp::{TcpAcceptor, TcpDialer};
pub use transport::{FramedTransport, MemoryTransport, TcpTransport, Transport};

/// Receives inbound traffic from a [`Connection`].
///
/// Called on the connection's reader task. Implementations must not block.
pub trait ConnectionListener: Send + Sync {
    /// An async message arrived.
    fn on_message(&self, _payload: &[u8]) {}

    /// A synchronous request arrived. Return `Some` to answer it.
    ///
    /// The first listener returning `Some` answers; later listeners are not
    /// consulted for that request.
    fn on_request(&self, _payload: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// The connection failed. Called at most once, never after a local
    /// `disconnect`.
    fn on_disconnect(&self, _error: &ConnectionError) {}
}

/// A connection to one remote endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open the connection to `address` within `timeout`.
    ///
    /// # Errors
    ///
    /// - `Instantiation`: the link could not be opened
    /// - `Timeout`: the link did not open in time
    /// - `Closed`: the connection was disconnected before or during the call
    /// - `AlreadyConnected`: the connection is already open or opening
    async fn connect(&self, address: &str, timeout: Duration) -> Result<(), ConnectionError>;

    /// Send a request and wait for its reply.
    ///
    /// At most one request is outstanding per connection; concurrent callers
    /// wait their turn inside `timeout`.
    async fn send_synch(&self, message: Vec<u8>, timeout: Duration)
        -> Result<Vec<u8>, ConnectionError>;

    /// Queue a message. Messages leave in the order they were queued.
    fn send_asynch(&self, message: Vec<u8>) -> Result<(), ConnectionError>;

    /// Register a listener for inbound traffic.
    fn add_listener(&self, listener: Arc<dyn ConnectionListener>);

    /// Close the connection. Idempotent.
    fn disconnect(&self);

    /// Whether the connection is open.
    fn is_connected(&self) -> bool;
}
