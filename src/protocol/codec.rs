//! Frame encoding and decoding
// (c) 2026 The muxrpc authors

use bytes::{BufMut as _, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use super::packet::{Body, Encoding, Flags, Packet};

/// Errors from the frame codec.
///
/// All of these are fatal to the connection: after one of them the byte stream can
/// no longer be trusted to be aligned on a frame boundary.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The connection ended part way through a frame
    #[error("truncated frame: connection ended inside the {0}")]
    Truncated(&'static str),
    /// The frame violated the framing rules
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The frame announced a body larger than we are prepared to accept
    #[error("frame body of {size} bytes exceeds the limit of {limit} bytes")]
    TooLong {
        /// announced size
        size: u32,
        /// configured limit
        limit: u32,
    },
    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The fixed-size frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Flag byte
    pub flags: Flags,
    /// Body length in bytes
    pub length: u32,
    /// Stream id, exactly as it appears on the wire
    pub id: i32,
}

impl Header {
    /// The on-wire size of the header, which is fixed (any change would be a new framing version)
    pub const SIZE: usize = 9;

    /// The header of the goodbye frame: all zeroes
    pub const GOODBYE: Header = Header {
        flags: Flags::empty(),
        length: 0,
        id: 0,
    };

    /// Serializes the header
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.flags.bits();
        out[1..5].copy_from_slice(&self.length.to_be_bytes());
        out[5..9].copy_from_slice(&self.id.to_be_bytes());
        out
    }

    /// Deserializes a header. No validity checks are applied.
    #[must_use]
    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            flags: Flags::from_bits_retain(raw[0]),
            length: u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]),
            id: i32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]),
        }
    }

    /// Is this the goodbye frame?
    #[must_use]
    pub fn is_goodbye(&self) -> bool {
        *self == Self::GOODBYE
    }
}

/// Builds the complete wire image of one packet.
///
/// This checks the body length against `limit`, so that we never send something the
/// peer would be entitled to reject.
pub fn encode(packet: &Packet, limit: u32) -> Result<Bytes, CodecError> {
    let body = packet.body.as_bytes();
    let length = u32::try_from(body.len()).map_err(|_| CodecError::TooLong {
        size: u32::MAX,
        limit,
    })?;
    if length > limit {
        return Err(CodecError::TooLong {
            size: length,
            limit,
        });
    }
    let header = Header {
        flags: packet.flags(),
        length,
        id: packet.id,
    };
    let mut buf = BytesMut::with_capacity(Header::SIZE + body.len());
    buf.put_slice(&header.to_bytes());
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Turns a header and its body bytes into a [`Packet`], checking the flags as it goes
pub fn assemble(header: Header, body: Bytes) -> Result<Packet, CodecError> {
    let invalid = || {
        CodecError::Malformed(format!(
            "invalid flags {:?} on stream {}",
            header.flags, header.id
        ))
    };
    if !header.flags.is_valid() {
        return Err(invalid());
    }
    let body = match header.flags.encoding().ok_or_else(invalid)? {
        Encoding::Binary => Body::Binary(body),
        Encoding::Json => Body::Json(body),
        Encoding::String => Body::String(String::from_utf8(body.to_vec()).map_err(|e| {
            CodecError::Malformed(format!("string body on stream {} is not UTF-8: {e}", header.id))
        })?),
    };
    Ok(Packet {
        id: header.id,
        stream: header.flags.contains(Flags::STREAM),
        end_err: header.flags.contains(Flags::END_ERR),
        body,
    })
}

/// Reads one complete frame.
///
/// Returns `Ok(None)` if the peer ended the session cleanly, either by sending the
/// goodbye frame or by closing the connection on a frame boundary.
pub async fn read_packet<R>(reader: &mut R, limit: u32) -> Result<Option<Packet>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; Header::SIZE];
    let mut filled = 0;
    while filled < Header::SIZE {
        let n = reader.read(&mut raw[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::Truncated("header"));
        }
        filled += n;
    }
    let header = Header::from_bytes(&raw);
    if header.is_goodbye() {
        return Ok(None);
    }
    if !header.flags.is_valid() {
        return Err(CodecError::Malformed(format!(
            "invalid flags {:?} on stream {}",
            header.flags, header.id
        )));
    }
    if header.length > limit {
        return Err(CodecError::TooLong {
            size: header.length,
            limit,
        });
    }

    let mut body = BytesMut::zeroed(header.length as usize);
    if let Err(e) = reader.read_exact(&mut body).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(CodecError::Truncated("body"));
        }
        return Err(e.into());
    }
    assemble(header, body.freeze()).map(Some)
}

/// Writes one complete frame and flushes it.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet, limit: u32) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(packet, limit)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes the goodbye frame and flushes it.
pub async fn write_goodbye<W>(writer: &mut W) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&Header::GOODBYE.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/////////////////////////////////////////////////////////////////////////////////////////////
