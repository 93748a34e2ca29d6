//! Packetizer and wire-format definitions.
//!
//! Everything that crosses the byte stream between sender and receiver is
//! defined here:
//! - [`packetize`] slices a file into densely numbered fixed-size [`Packet`]s.
//! - [`Frame`] is one unit on the data direction (a packet or the
//!   end-of-stream sentinel).
//! - ACKs travel in the opposite direction as bare `int32` values.
//! - The session handshake exchanges length-prefixed UTF-8 strings.
//!
//! No protocol decisions happen here; this module only converts between
//! values and bytes.
//!
//! # Wire format
//!
//! All integers are **big-endian, signed 32-bit** unless noted.
//!
//! ```text
//!  data frame                           end-of-stream sentinel
//! +------------------+                 +------------------+
//! | sequence number  |  int32 (>= 1)   |        -1        |  int32, nothing follows
//! +------------------+                 +------------------+
//! |  payload length  |  int32 (>= 0)
//! +------------------+
//! | payload bytes ...|
//! +------------------+
//!
//!  ACK (receiver -> sender)             handshake string
//! +------------------+                 +--------+------------------+
//! | cumulative ack   |  int32          | len u16| UTF-8 bytes ...  |
//! +------------------+                 +--------+------------------+
//! ```
//!
//! An ACK value of `-1` is the receiver's end-of-session marker.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sequence number that marks the end of the packet stream.
pub const END_OF_STREAM: i32 = -1;

/// ACK value the receiver writes once it has finished the session.
pub const END_OF_SESSION: i32 = -1;

/// Byte length of a data frame header (sequence + payload length).
pub const HEADER_LEN: usize = 8;

/// Largest payload a peer may announce before the frame is rejected.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// One numbered slice of the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Position of this packet in the file, starting at 1.
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// A unit on the sender-to-receiver direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Packet),
    EndOfStream,
}

/// Split `data` into packets of `chunk_size` bytes numbered `1..=N`.
///
/// The final packet carries the remainder and may be shorter.  An empty
/// buffer yields no packets.
///
/// # Panics
///
/// Panics if `chunk_size` is zero.
pub fn packetize(data: &[u8], chunk_size: usize) -> Vec<Packet> {
    assert!(chunk_size >= 1, "chunk_size must be at least 1");
    data.chunks(chunk_size)
        .zip(1u32..)
        .map(|(chunk, seq)| Packet {
            seq,
            payload: chunk.to_vec(),
        })
        .collect()
}

impl Packet {
    /// Serialise this packet as a data frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&(self.seq as i32).to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Data(packet) => packet.encode(),
            Frame::EndOfStream => END_OF_STREAM.to_be_bytes().to_vec(),
        }
    }
}

/// Errors that can arise while reading or writing the wire format.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),
    /// The stream ended inside a field.
    #[error("stream ended after {got} of {expected} bytes")]
    Truncated { expected: usize, got: usize },
    /// Neither positive nor the sentinel.
    #[error("invalid sequence number {0}")]
    InvalidSequence(i32),
    #[error("invalid payload length {0}")]
    InvalidLength(i32),
    #[error("payload length {0} exceeds limit of {}", MAX_PAYLOAD_LEN)]
    PayloadTooLarge(usize),
    #[error("handshake string is not valid UTF-8")]
    InvalidUtf8,
    /// Longer than a `u16` length prefix can describe.
    #[error("handshake string of {0} bytes is too long")]
    StringTooLong(usize),
}

// ---------------------------------------------------------------------------
// Stream helpers
// ---------------------------------------------------------------------------

/// Fill `buf` completely, or report how far the stream got.
///
/// Returns `Ok(false)` when the stream was already at EOF before the first
/// byte, which callers treat as a clean close on a field boundary.
async fn read_field<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(FrameError::Truncated {
                expected: buf.len(),
                got: filled,
            });
        }
        filled += n;
    }
    Ok(true)
}

/// Like [`read_field`] but EOF anywhere is a truncation.
async fn read_required<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    if read_field(reader, buf).await? {
        Ok(())
    } else {
        Err(FrameError::Truncated {
            expected: buf.len(),
            got: 0,
        })
    }
}

/// Read the next frame from the data direction.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
/// A stream that ends inside a frame is [`FrameError::Truncated`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut word = [0u8; 4];
    if !read_field(reader, &mut word).await? {
        return Ok(None);
    }
    let seq = i32::from_be_bytes(word);
    if seq == END_OF_STREAM {
        return Ok(Some(Frame::EndOfStream));
    }
    if seq <= 0 {
        return Err(FrameError::InvalidSequence(seq));
    }

    read_required(reader, &mut word).await?;
    let len = i32::from_be_bytes(word);
    if len < 0 {
        return Err(FrameError::InvalidLength(len));
    }
    let len = len as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(len));
    }

    let mut payload = Vec::with_capacity(len);
    let got = (&mut *reader).take(len as u64).read_to_end(&mut payload).await?;
    if got < len {
        return Err(FrameError::Truncated { expected: len, got });
    }

    Ok(Some(Frame::Data(Packet {
        seq: seq as u32,
        payload,
    })))
}

/// Write one frame.  The caller decides when to flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

/// Read one ACK value.  `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_ack<R>(reader: &mut R) -> Result<Option<i32>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut word = [0u8; 4];
    if !read_field(reader, &mut word).await? {
        return Ok(None);
    }
    Ok(Some(i32::from_be_bytes(word)))
}

pub async fn write_ack<W>(writer: &mut W, ack: i32) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&ack.to_be_bytes()).await?;
    Ok(())
}

/// Write a `u16`-length-prefixed UTF-8 string (handshake messages).
pub async fn write_utf<W>(writer: &mut W, text: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = text.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| FrameError::StringTooLong(bytes.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

pub async fn read_utf<R>(reader: &mut R) -> Result<String, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 2];
    read_required(reader, &mut len).await?;
    let mut bytes = vec![0u8; u16::from_be_bytes(len) as usize];
    read_required(reader, &mut bytes).await?;
    String::from_utf8(bytes).map_err(|_| FrameError::InvalidUtf8)
}
