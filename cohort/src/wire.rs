//! Wire format for frames carried over byte streams.
//!
//! Frame format: `[length:4][checksum:4][frame:N]`
//!
//! - **length**: size of `frame` in bytes (little-endian u32)
//! - **checksum**: CRC32C of `frame` (little-endian u32)
//! - **frame**: one connection frame (see [`Frame`](crate::connection::Frame))
//!
//! Oversize frames and checksum mismatches are I/O errors: the connection
//! that reads them fails.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ConnectionError;

/// Header size: 4 (length) + 4 (checksum).
pub const HEADER_SIZE: usize = 8;

/// Default maximum frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Fixed-size header preceding each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame length, header excluded.
    pub length: u32,
    /// CRC32C of the frame bytes.
    pub checksum: u32,
}

impl FrameHeader {
    /// Serialize header into `buf` (at least `HEADER_SIZE` bytes).
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Deserialize a header from the first `HEADER_SIZE` bytes of `buf`.
    pub fn deserialize(buf: &[u8]) -> Result<Self, ConnectionError> {
        if buf.len() < HEADER_SIZE {
            return Err(ConnectionError::MalformedFrame(format!(
                "need {} header bytes, have {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            checksum: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    fn check_length(&self, max_frame_size: usize) -> Result<usize, ConnectionError> {
        let size = self.length as usize;
        if size > max_frame_size {
            return Err(ConnectionError::FrameTooLarge {
                size,
                max: max_frame_size,
            });
        }
        Ok(size)
    }
}

fn verify(header: &FrameHeader, frame: &[u8]) -> Result<(), ConnectionError> {
    let actual = crc32c::crc32c(frame);
    if actual != header.checksum {
        return Err(ConnectionError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }
    Ok(())
}

/// Encode a frame with its header.
///
/// # Errors
///
/// `FrameTooLarge` if `frame` exceeds `max_frame_size`.
pub fn encode_frame(frame: &[u8], max_frame_size: usize) -> Result<Vec<u8>, ConnectionError> {
    if frame.len() > max_frame_size {
        return Err(ConnectionError::FrameTooLarge {
            size: frame.len(),
            max: max_frame_size,
        });
    }
    let header = FrameHeader {
        length: frame.len() as u32,
        checksum: crc32c::crc32c(frame),
    };
    let mut data = vec![0u8; HEADER_SIZE + frame.len()];
    header.serialize_into(&mut data[..HEADER_SIZE]);
    data[HEADER_SIZE..].copy_from_slice(frame);
    Ok(data)
}

/// Read one frame from a byte stream.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<Vec<u8>>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::deserialize(&head)?;
    let size = header.check_length(max_frame_size)?;
    let mut frame = vec![0u8; size];
    reader.read_exact(&mut frame).await?;
    verify(&header, &frame)?;
    Ok(Some(frame))
}

/// Write one frame to a byte stream and flush it.
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &[u8],
    max_frame_size: usize,
) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let data = encode_frame(frame, max_frame_size)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}
