//! Wire codec for the lanlink protocol
//!
//! Every message on the wire is built from three primitives:
//!
//! - **Integers**: u64, 8 bytes, little-endian. Decoding tolerates short
//!   buffers by treating the missing high bytes as zero.
//! - **Variable-length fields**: `[u64 length][raw bytes]`. Strings are raw
//!   UTF-8 with no terminator.
//! - **Control bytes**: a single byte from [`ControlByte`] identifying the
//!   message kind.
//!
//! Each connection opens with a single [`PROTOCOL_VERSION`] byte followed by
//! a control byte; a responder drops connections carrying any other version.
//! The `Explore`, `Get` and `ExecCmd` sub-protocols additionally carry the
//! fixed 8-byte [`MAGIC`] frame as a lightweight integrity check.
//!
//! Failure semantics: any read or write error aborts the current connection's
//! handler. There is no retry at this layer; resuming is a transfer-level
//! concern.

use crate::{ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol revision spoken by this implementation.
///
/// Exactly one wire layout exists per revision; incompatible layouts are
/// never auto-detected on the same port.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed magic frame prefixing the explore/get/exec sub-protocols.
pub const MAGIC: [u8; 8] = [0, 2, 0, 8, 2, 0, 0, 0];

/// Upper bound for a single length-prefixed metadata field (1 MiB).
///
/// File payload chunks are bounded separately by the negotiated buffer size.
pub const MAX_FIELD_LEN: u64 = 1024 * 1024;

/// Control bytes identifying the kind of each message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlByte {
    /// Identity request; responder replies with id, name, OS
    Name = 0,
    /// Text message delivery
    Msg = 1,
    /// Resource (file/directory) transfer
    Resources = 2,
    /// Remote directory listing request
    Explore = 3,
    /// Remote download request (responder becomes the resource sender)
    Get = 4,
    /// Remote command channel
    ExecCmd = 5,
    /// Directory tag in an explore listing
    Dir = 6,
    /// File tag in an explore listing
    File = 7,
    /// Application-level error reply
    Error = 8,
    /// Cancellation signal at a chunk boundary
    Canceled = 9,
    /// Continue signal at a chunk boundary
    Ok = 10,
    /// Ask the original sender to resume an interrupted transfer
    ContinueTransfer = 11,
    /// Notice that the peer's messages have been viewed
    SeenNotice = 12,
}

impl TryFrom<u8> for ControlByte {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ControlByte::Name),
            1 => Ok(ControlByte::Msg),
            2 => Ok(ControlByte::Resources),
            3 => Ok(ControlByte::Explore),
            4 => Ok(ControlByte::Get),
            5 => Ok(ControlByte::ExecCmd),
            6 => Ok(ControlByte::Dir),
            7 => Ok(ControlByte::File),
            8 => Ok(ControlByte::Error),
            9 => Ok(ControlByte::Canceled),
            10 => Ok(ControlByte::Ok),
            11 => Ok(ControlByte::ContinueTransfer),
            12 => Ok(ControlByte::SeenNotice),
            other => Err(ProtocolError::UnexpectedControl(other)),
        }
    }
}

/// Encode a u64 as 8 little-endian bytes
pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

/// Decode a little-endian u64, tolerating buffers shorter than 8 bytes.
///
/// Missing high bytes contribute zero, so `decode_u64(&[1])` is `1`.
pub fn decode_u64(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, b) in bytes.iter().take(8).enumerate() {
        value |= (*b as u64) << (i * 8);
    }
    value
}

/// Read a u64 length/value field
pub async fn read_u64<S>(stream: &mut S) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await?;
    Ok(decode_u64(&buf))
}

/// Write a u64 length/value field
pub async fn write_u64<S>(stream: &mut S, value: u64) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_u64(value)).await?;
    Ok(())
}

/// Read a length-prefixed byte field, bounded by [`MAX_FIELD_LEN`]
pub async fn read_bytes<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = read_u64(stream).await?;
    if len > MAX_FIELD_LEN {
        return Err(ProtocolError::FieldTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed byte field
pub async fn write_bytes<S>(stream: &mut S, bytes: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_u64(stream, bytes.len() as u64).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

/// Read a length-prefixed UTF-8 string field
pub async fn read_string<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let bytes = read_bytes(stream).await?;
    String::from_utf8(bytes)
        .map_err(|e| ProtocolError::InvalidFrame(format!("non-UTF-8 string field: {e}")))
}

/// Write a length-prefixed UTF-8 string field
pub async fn write_string<S>(stream: &mut S, value: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_bytes(stream, value.as_bytes()).await
}

/// Read a single control byte
pub async fn read_control<S>(stream: &mut S) -> Result<ControlByte>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    ControlByte::try_from(buf[0])
}

/// Write a single control byte
pub async fn write_control<S>(stream: &mut S, control: ControlByte) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[control as u8]).await?;
    Ok(())
}

/// Write the protocol version and opening control byte of a request
pub async fn write_header<S>(stream: &mut S, control: ControlByte) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[PROTOCOL_VERSION, control as u8]).await?;
    Ok(())
}

/// Read and validate the protocol version, then the opening control byte
pub async fn read_header<S>(stream: &mut S) -> Result<ControlByte>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: buf[0],
        });
    }
    read_control(stream).await
}

/// Write the fixed magic frame
pub async fn write_magic<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&MAGIC).await?;
    Ok(())
}

/// Read the fixed magic frame; mismatch is a framing error.
///
/// The caller closes the connection without sending any reply, since the
/// other side may not be speaking the protocol at all.
pub async fn read_magic<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await?;
    if buf != MAGIC {
        return Err(ProtocolError::BadMagic);
    }
    Ok(())
}
