//! Link layer: a bidirectional frame pipe between two endpoints.
//!
//! A [`Dialer`] opens links to an address; an [`Acceptor`] yields links
//! opened by remote dialers. Both sides see the same [`Link`] shape, so a
//! [`FramedConnection`](super::FramedConnection) runs unchanged over memory
//! channels or TCP.

use async_trait::async_trait;

use crate::error::ConnectionError;

/// Receiving half of a link.
#[async_trait]
pub trait FrameReader: Send {
    /// Read the next frame. `Ok(None)` means the remote closed cleanly.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;
}

/// Sending half of a link.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one frame.
    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), ConnectionError>;

    /// Close the sending half. The remote reader sees end of stream.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// An open link.
pub struct Link {
    /// Receiving half.
    pub reader: Box<dyn FrameReader>,
    /// Sending half.
    pub writer: Box<dyn FrameWriter>,
    /// Address of the remote endpoint.
    pub peer: String,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

/// Opens outbound links.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Open a link to `address`.
    async fn dial(&self, address: &str) -> Result<Link, ConnectionError>;
}

/// Accepts inbound links.
#[async_trait]
pub trait Acceptor: Send + 'static {
    /// Wait for the next inbound link.
    async fn accept(&mut self) -> Result<Link, ConnectionError>;

    /// Address remote dialers use to reach this acceptor.
    fn local_address(&self) -> String;
}
