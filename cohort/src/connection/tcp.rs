//! TCP links carrying checksummed frames.
//!
//! Each frame travels as `[length:4][checksum:4][frame]` (see
//! [`wire`](crate::wire)).

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::wire;

use super::link::{Acceptor, Dialer, FrameReader, FrameWriter, Link};

/// Disable Nagle on `stream`, logging failures.
fn set_nodelay(stream: &TcpStream, peer: &str) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
    }
}

fn link_from_stream(stream: TcpStream, peer: String, max_frame_size: usize) -> Link {
    set_nodelay(&stream, &peer);
    let (read, write) = stream.into_split();
    Link {
        reader: Box::new(TcpFrameReader {
            stream: BufReader::new(read),
            max_frame_size,
        }),
        writer: Box::new(TcpFrameWriter {
            stream: write,
            max_frame_size,
        }),
        peer,
    }
}

/// Opens TCP links.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    max_frame_size: usize,
}

impl TcpDialer {
    /// Create a dialer using the frame limit from `config`.
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
        }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(&ConnectionConfig::default())
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<Link, ConnectionError> {
        let stream = TcpStream::connect(address).await?;
        debug!(address = %address, "tcp link opened");
        Ok(link_from_stream(
            stream,
            address.to_string(),
            self.max_frame_size,
        ))
    }
}

/// Accepts TCP links.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    local_address: String,
    max_frame_size: usize,
}

impl TcpAcceptor {
    /// Bind to `address` (use port 0 for an ephemeral port).
    pub async fn bind(address: &str, config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(address).await?;
        let local_address = listener.local_addr()?.to_string();
        debug!(address = %local_address, "tcp acceptor bound");
        Ok(Self {
            listener,
            local_address,
            max_frame_size: config.max_frame_size,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<Link, ConnectionError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "tcp link accepted");
        Ok(link_from_stream(
            stream,
            peer.to_string(),
            self.max_frame_size,
        ))
    }

    fn local_address(&self) -> String {
        self.local_address.clone()
    }
}

struct TcpFrameReader {
    stream: BufReader<OwnedReadHalf>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        wire::read_frame(&mut self.stream, self.max_frame_size).await
    }
}

struct TcpFrameWriter {
    stream: OwnedWriteHalf,
    max_frame_size: usize,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        wire::write_frame(&mut self.stream, &frame, self.max_frame_size).await
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
