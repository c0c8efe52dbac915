//! [`Connection`] implementation over a [`Link`].
//!
//! # Tasks
//!
//! Each open connection runs two tasks:
//!
//! - **writer**: drains a FIFO queue of encoded frames onto the link. Async
//!   sends, requests and replies all go through it, so per-connection order
//!   is the order of enqueueing.
//! - **reader**: reads frames, delivers messages and requests to listeners,
//!   completes pending requests with their replies and answers pings.
//!
//! When `ping_interval` is non-zero a third task, the **monitor**, sends a
//! ping every interval and fails the connection with `Timeout` if no pong
//! arrives within `ping_timeout`.
//!
//! # Shutdown
//!
//! `disconnect` drops the queue sender so the writer flushes what is already
//! queued (bounded by `drain_timeout`) and closes the link, then stops the
//! reader and fails pending requests with `Closed`. A link failure does the
//! same and notifies listeners once. A local disconnect never notifies.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;

use super::correlation::PendingRequests;
use super::frame::{CorrelationId, Frame, FrameKind};
use super::link::{Dialer, FrameReader, FrameWriter, Link};
use super::{Connection, ConnectionListener};

const IDLE: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;
const CLOSED: u8 = 3;

/// A connection multiplexing async messages and request/reply pairs over
/// one link.
///
/// Created idle by a [`Transport`](super::Transport) and opened with
/// [`Connection::connect`], or created already open around an accepted
/// link with [`FramedConnection::accepted`]. Once closed it stays closed.
pub struct FramedConnection {
    shared: Arc<Shared>,
    dialer: Option<Arc<dyn Dialer>>,
    synch_lock: tokio::sync::Mutex<()>,
}

struct Shared {
    state: AtomicU8,
    config: ConnectionConfig,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: PendingRequests,
    shutdown: CancellationToken,
    peer: Mutex<Option<String>>,
    /// Highest ping sequence answered by the peer.
    last_pong: AtomicU64,
    pong: Notify,
}

impl FramedConnection {
    /// Create an idle connection that opens links through `dialer`.
    pub fn new(dialer: Arc<dyn Dialer>, config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            dialer: Some(dialer),
            synch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Wrap an accepted link. The connection is open on return.
    ///
    /// `listeners` are registered before the reader starts, so no inbound
    /// frame is missed.
    pub fn accepted(
        link: Link,
        config: ConnectionConfig,
        listeners: Vec<Arc<dyn ConnectionListener>>,
    ) -> Self {
        let shared = Arc::new(Shared::new(config));
        shared.listeners.write().extend(listeners);
        shared.state.store(CONNECTED, Ordering::SeqCst);
        if !Shared::start(&shared, link) {
            debug!("accepted link closed before start");
        }
        Self {
            shared,
            dialer: None,
            synch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Address of the remote endpoint, once open.
    pub fn peer_address(&self) -> Option<String> {
        self.shared.peer.lock().clone()
    }

    /// Number of synchronous requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}

impl std::fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("state", &self.shared.state.load(Ordering::SeqCst))
            .field("peer", &self.peer_address())
            .finish()
    }
}

impl Shared {
    fn new(config: ConnectionConfig) -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            config,
            listeners: RwLock::new(Vec::new()),
            outbound: Mutex::new(None),
            pending: PendingRequests::default(),
            shutdown: CancellationToken::new(),
            peer: Mutex::new(None),
            last_pong: AtomicU64::new(0),
            pong: Notify::new(),
        }
    }

    /// Spawn the I/O tasks for `link`. Returns false, dropping the link, if
    /// the connection was closed in the meantime.
    fn start(shared: &Arc<Self>, link: Link) -> bool {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            // `close` marks the state before taking the sender, so checking
            // under the lock never installs a sender it would miss.
            let mut outbound = shared.outbound.lock();
            if shared.state.load(Ordering::SeqCst) != CONNECTED {
                return false;
            }
            *outbound = Some(tx);
        }
        *shared.peer.lock() = Some(link.peer.clone());
        tokio::spawn(writer_task(shared.clone(), link.writer, rx));
        tokio::spawn(reader_task(shared.clone(), link.reader));
        if !shared.config.ping_interval.is_zero() {
            tokio::spawn(monitor_task(shared.clone()));
        }
        true
    }

    fn enqueue(&self, frame: Frame) -> Result<(), ConnectionError> {
        let size = frame.encoded_len();
        if size > self.config.max_frame_size {
            return Err(ConnectionError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        let outbound = self.outbound.lock();
        let Some(sender) = outbound.as_ref() else {
            return Err(match self.state.load(Ordering::SeqCst) {
                CLOSED => ConnectionError::Closed,
                _ => ConnectionError::NotConnected,
            });
        };
        sender
            .send(frame.encode())
            .map_err(|_| ConnectionError::Closed)
    }

    /// Tear down. Returns whether this call performed the teardown.
    fn close(&self, from: u8) -> bool {
        let closed = if from == CONNECTED {
            self.state
                .compare_exchange(CONNECTED, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        } else {
            self.state.swap(CLOSED, Ordering::SeqCst) != CLOSED
        };
        if !closed {
            return false;
        }
        // Dropping the sender lets the writer flush and exit.
        self.outbound.lock().take();
        self.shutdown.cancel();
        self.pending.fail_all(ConnectionError::Closed);
        true
    }

    fn fail(&self, error: ConnectionError) {
        if !self.close(CONNECTED) {
            return;
        }
        warn!(peer = ?self.peer.lock().as_deref(), error = %error, "connection failed");
        for listener in self.listeners_snapshot() {
            listener.on_disconnect(&error);
        }
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.read().clone()
    }

    fn dispatch(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Async => {
                for listener in self.listeners_snapshot() {
                    listener.on_message(&frame.payload);
                }
            }
            FrameKind::Request => {
                let reply = self
                    .listeners_snapshot()
                    .into_iter()
                    .find_map(|listener| listener.on_request(&frame.payload));
                match reply {
                    Some(reply) => {
                        if let Err(e) = self.enqueue(Frame::reply(frame.correlation, reply)) {
                            debug!(correlation = %frame.correlation, error = %e, "reply dropped");
                        }
                    }
                    None => {
                        debug!(correlation = %frame.correlation, "request left unanswered");
                    }
                }
            }
            FrameKind::Reply => {
                self.pending.complete(frame.correlation, Ok(frame.payload));
            }
            FrameKind::Ping => {
                if let Err(e) = self.enqueue(Frame::pong(frame.correlation)) {
                    debug!(correlation = %frame.correlation, error = %e, "pong dropped");
                }
            }
            FrameKind::Pong => {
                self.last_pong
                    .fetch_max(frame.correlation.value(), Ordering::SeqCst);
                self.pong.notify_one();
            }
        }
    }
}

async fn writer_task(
    shared: Arc<Shared>,
    mut writer: Box<dyn FrameWriter>,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = queue.recv().await {
        let result = if shared.shutdown.is_cancelled() {
            match tokio::time::timeout(shared.config.drain_timeout, writer.write_frame(frame)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("drain timed out, dropping queued frames");
                    break;
                }
            }
        } else {
            writer.write_frame(frame).await
        };
        if let Err(e) = result {
            shared.fail(e);
            break;
        }
    }
    let _ = writer.close().await;
}

async fn reader_task(shared: Arc<Shared>, mut reader: Box<dyn FrameReader>) {
    loop {
        let next = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            next = reader.read_frame() => next,
        };
        match next {
            Ok(Some(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => shared.dispatch(frame),
                Err(e) => {
                    shared.fail(e);
                    break;
                }
            },
            Ok(None) => {
                shared.fail(ConnectionError::Closed);
                break;
            }
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
    }
}

async fn monitor_task(shared: Arc<Shared>) {
    let interval = shared.config.ping_interval;
    let timeout = shared.config.ping_timeout;
    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        seq += 1;
        if shared.enqueue(Frame::ping(CorrelationId::new(seq))).is_err() {
            return;
        }
        let answered = async {
            while shared.last_pong.load(Ordering::SeqCst) < seq {
                shared.pong.notified().await;
            }
        };
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            answered = tokio::time::timeout(timeout, answered) => {
                if answered.is_err() {
                    warn!(peer = ?shared.peer.lock().as_deref(), seq, "ping unanswered");
                    shared.fail(ConnectionError::Timeout);
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Connection for FramedConnection {
    async fn connect(&self, address: &str, timeout: Duration) -> Result<(), ConnectionError> {
        let Some(dialer) = self.dialer.clone() else {
            return Err(ConnectionError::AlreadyConnected);
        };
        if let Err(current) = self.shared.state.compare_exchange(
            IDLE,
            CONNECTING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(match current {
                CLOSED => ConnectionError::Closed,
                _ => ConnectionError::AlreadyConnected,
            });
        }

        debug!(address = %address, "opening connection");
        let dialed = tokio::select! {
            _ = self.shared.shutdown.cancelled() => Err(ConnectionError::Closed),
            dialed = tokio::time::timeout(timeout, dialer.dial(address)) => match dialed {
                Err(_) => Err(ConnectionError::Timeout),
                Ok(Err(e)) => Err(ConnectionError::Instantiation(e.to_string())),
                Ok(Ok(link)) => Ok(link),
            },
        };

        let link = match dialed {
            Ok(link) => link,
            Err(e) => {
                self.shared.close(CONNECTING);
                return Err(e);
            }
        };

        if self
            .shared
            .state
            .compare_exchange(CONNECTING, CONNECTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Disconnected while dialing; the link is dropped here.
            return Err(ConnectionError::Closed);
        }
        if !Shared::start(&self.shared, link) {
            // Disconnected between the state change and the task start.
            return Err(ConnectionError::Closed);
        }
        debug!(address = %address, "connection open");
        Ok(())
    }

    async fn send_synch(
        &self,
        message: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, ConnectionError> {
        let exchange = async {
            let _exclusive = self.synch_lock.lock().await;
            let id = self.shared.pending.next_id();
            let mut slot = self.shared.pending.register(id);
            self.shared.enqueue(Frame::request(id, message))?;
            slot.wait().await
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }

    fn send_asynch(&self, message: Vec<u8>) -> Result<(), ConnectionError> {
        self.shared.enqueue(Frame::message(message))
    }

    fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.shared.listeners.write().push(listener);
    }

    fn disconnect(&self) {
        if self.shared.close(IDLE) {
            debug!(peer = ?self.peer_address(), "connection closed locally");
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == CONNECTED
    }
}

impl Drop for FramedConnection {
    fn drop(&mut self) {
        self.shared.close(IDLE);
    }
}
