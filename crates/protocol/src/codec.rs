//! Fixed-width binary encoding
//!
//! Every USB/IP structure has a fixed size on the wire. Integers are
//! big-endian (network byte order), padding is explicit and written as zeros,
//! and string fields occupy a fixed number of bytes.
//!
//! # Frame Layout
//!
//! ```text
//! handshake:  [ControlHeader: 8][op-specific body]
//! transfer:   [MessageHeader: 20][command body: 28][payload][iso descriptors]
//! ```
//!
//! Decoding never reads past the fixed size of a structure; short input is
//! reported as [`ProtocolError::MalformedFrame`].

use crate::error::{ProtocolError, Result};
use std::io::{Cursor, Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest transfer buffer accepted from a peer (32 MiB)
pub const MAX_TRANSFER_SIZE: usize = 32 * 1024 * 1024;

/// Largest isochronous packet count accepted from a peer
pub const MAX_ISO_PACKETS: usize = 1024;

/// A structure with a fixed wire size
///
/// Implementors provide `write_to` / `read_from`; `encode` and `decode` wrap
/// them with exact sizing and the short-input check.
///
/// # Example
/// ```
/// use protocol::{ControlHeader, FixedFrame, OpCode};
///
/// let header = ControlHeader::request(OpCode::ReqDevlist);
/// let bytes = header.encode().unwrap();
/// assert_eq!(bytes.len(), ControlHeader::SIZE);
/// assert_eq!(ControlHeader::decode(&bytes).unwrap(), header);
/// ```
pub trait FixedFrame: Sized {
    /// Exact number of bytes on the wire
    const SIZE: usize;

    /// Write exactly `SIZE` bytes
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()>;

    /// Read exactly `SIZE` bytes
    fn read_from<R: Read>(reader: &mut R) -> Result<Self>;

    /// Encode into a freshly allocated buffer of exactly `SIZE` bytes
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf)?;
        debug_assert_eq!(buf.len(), Self::SIZE);
        Ok(buf)
    }

    /// Decode from the first `SIZE` bytes of `bytes`
    fn decode(bytes: &[u8]) -> Result<Self> {
        ensure_len(bytes, Self::SIZE)?;
        Self::read_from(&mut Cursor::new(&bytes[..Self::SIZE]))
    }
}

/// Fail with `MalformedFrame` unless `bytes` holds at least `needed` bytes
pub fn ensure_len(bytes: &[u8], needed: usize) -> Result<()> {
    if bytes.len() < needed {
        return Err(ProtocolError::MalformedFrame {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

/// Write `len` zero bytes of padding
pub(crate) fn write_padding<W: Write>(writer: &mut W, len: usize) -> Result<()> {
    const ZEROS: [u8; 32] = [0u8; 32];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(ZEROS.len());
        writer.write_all(&ZEROS[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}

/// Consume `len` bytes of padding without inspecting them
pub(crate) fn skip_padding<R: Read>(reader: &mut R, len: usize) -> Result<()> {
    let mut padding = [0u8; 32];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(padding.len());
        reader.read_exact(&mut padding[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}

/// Async: read one fixed-size structure from an async reader
#[cfg(feature = "async")]
pub async fn read_fixed_async<T, R>(reader: &mut R) -> Result<T>
where
    T: FixedFrame,
    R: AsyncReadExt + Unpin,
{
    let mut buf = vec![0u8; T::SIZE];
    reader.read_exact(&mut buf).await?;
    T::decode(&buf)
}

/// Async: read one fixed-size structure, or `None` if the stream ends first
///
/// Only an end of stream before the first byte counts as a clean close; a
/// stream that ends partway through the structure is a `MalformedFrame`.
#[cfg(feature = "async")]
pub async fn read_fixed_or_eof_async<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: FixedFrame,
    R: AsyncReadExt + Unpin,
{
    let mut buf = vec![0u8; T::SIZE];
    match fill_async(reader, &mut buf).await? {
        0 => Ok(None),
        filled if filled < T::SIZE => Err(ProtocolError::MalformedFrame {
            needed: T::SIZE,
            available: filled,
        }),
        _ => T::decode(&buf).map(Some),
    }
}

/// Async: read exactly `len` bytes of trailing frame data
///
/// The stream ending early means the frame was cut short: `MalformedFrame`.
#[cfg(feature = "async")]
pub async fn read_exact_async<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let mut buf = vec![0u8; len];
    let filled = fill_async(reader, &mut buf).await?;
    if filled < len {
        return Err(ProtocolError::MalformedFrame {
            needed: len,
            available: filled,
        });
    }
    Ok(buf)
}

/// Read until `buf` is full or the stream ends; returns the bytes read
#[cfg(feature = "async")]
async fn fill_async<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncReadExt + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Async: write encoded frame bytes to an async writer
#[cfg(feature = "async")]
pub async fn write_frame_async<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer.write_all(frame).await?;
    Ok(())
}
