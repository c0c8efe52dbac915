//! In-process network for tests and single-process groups.
//!
//! Addresses are plain strings. Each link is a pair of unbounded channels,
//! so frames keep FIFO order and never block the sender.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ConnectionError;

use super::link::{Acceptor, Dialer, FrameReader, FrameWriter, Link};

/// In-process network.
///
/// Cloning yields a handle to the same network.
///
/// # Example
///
/// ```rust
/// use cohort::connection::{Acceptor, Dialer, MemoryNetwork};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let network = MemoryNetwork::new();
/// let mut acceptor = network.bind("group:1").unwrap();
/// let mut client = network.dial("group:1").await.unwrap();
/// let mut server = acceptor.accept().await.unwrap();
///
/// client.writer.write_frame(b"hello".to_vec()).await.unwrap();
/// let frame = server.reader.read_frame().await.unwrap();
/// assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<Link>>>,
    live_endpoints: Arc<AtomicUsize>,
    next_client: AtomicUsize,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("listeners", &self.inner.listeners.lock().len())
            .field("live_endpoints", &self.live_endpoints())
            .finish()
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting links at `address`.
    ///
    /// # Errors
    ///
    /// `Io` if another acceptor already holds the address.
    pub fn bind(&self, address: &str) -> Result<MemoryAcceptor, ConnectionError> {
        let mut listeners = self.inner.listeners.lock();
        if let Some(existing) = listeners.get(address) {
            if !existing.is_closed() {
                return Err(ConnectionError::Io(format!(
                    "address in use: {}",
                    address
                )));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(address.to_string(), tx);
        debug!(address = %address, "memory acceptor bound");
        Ok(MemoryAcceptor {
            address: address.to_string(),
            incoming: rx,
            network: self.clone(),
        })
    }

    /// Number of link endpoints not yet fully dropped.
    ///
    /// Each link has two endpoints. An endpoint stays live while either its
    /// reader or its writer exists.
    pub fn live_endpoints(&self) -> usize {
        self.inner.live_endpoints.load(Ordering::SeqCst)
    }

    fn endpoint(
        &self,
        sender: mpsc::UnboundedSender<Vec<u8>>,
        receiver: mpsc::UnboundedReceiver<Vec<u8>>,
        peer: String,
    ) -> Link {
        let guard = Arc::new(EndpointGuard::new(self.inner.live_endpoints.clone()));
        Link {
            reader: Box::new(MemoryFrameReader {
                receiver,
                _guard: guard.clone(),
            }),
            writer: Box::new(MemoryFrameWriter {
                sender: Some(sender),
                _guard: guard,
            }),
            peer,
        }
    }
}

#[async_trait]
impl Dialer for MemoryNetwork {
    async fn dial(&self, address: &str) -> Result<Link, ConnectionError> {
        let listener = self
            .inner
            .listeners
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| ConnectionError::Io(format!("connection refused: {}", address)))?;

        let client_address = format!(
            "memory-client-{}",
            self.inner.next_client.fetch_add(1, Ordering::Relaxed)
        );
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let server_side = self.endpoint(to_client, from_client, client_address);
        listener
            .send(server_side)
            .map_err(|_| ConnectionError::Io(format!("connection refused: {}", address)))?;

        debug!(address = %address, "memory link opened");
        Ok(self.endpoint(to_server, from_server, address.to_string()))
    }
}

/// Accepts links dialed to its address on a [`MemoryNetwork`].
///
/// Dropping the acceptor unbinds the address.
pub struct MemoryAcceptor {
    address: String,
    incoming: mpsc::UnboundedReceiver<Link>,
    network: MemoryNetwork,
}

impl std::fmt::Debug for MemoryAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAcceptor")
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> Result<Link, ConnectionError> {
        self.incoming.recv().await.ok_or(ConnectionError::Closed)
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.incoming.close();
        let mut listeners = self.network.inner.listeners.lock();
        if listeners.get(&self.address).is_some_and(|tx| tx.is_closed()) {
            listeners.remove(&self.address);
        }
    }
}

struct EndpointGuard {
    counter: Arc<AtomicUsize>,
}

impl EndpointGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for EndpointGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemoryFrameReader {
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    _guard: Arc<EndpointGuard>,
}

#[async_trait]
impl FrameReader for MemoryFrameReader {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        Ok(self.receiver.recv().await)
    }
}

struct MemoryFrameWriter {
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
    _guard: Arc<EndpointGuard>,
}

#[async_trait]
impl FrameWriter for MemoryFrameWriter {
    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        let sender = self.sender.as_ref().ok_or(ConnectionError::Closed)?;
        sender.send(frame).map_err(|_| ConnectionError::Closed)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.sender = None;
        Ok(())
    }
}
