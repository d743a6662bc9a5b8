//! MQTT 3.1.1 packet codec
//!
//! Bidirectional translation between byte streams and typed control packets.
//! The decoder is incremental: it returns `Ok(None)` until a complete packet
//! is buffered, so the connection layer can feed it partial reads.
//!
//! Strings and binary fields share one length-prefix reader/writer pair;
//! strings add UTF-8 and NUL validation on top.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Maximum remaining length representable in the 4-byte varint (~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default maximum packet size accepted from a client
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a Variable Byte Integer: base-128 digits least-significant first,
/// high bit chaining continuation. Returns (value, bytes_consumed).
/// A fourth byte that still chains is invalid.
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;

    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= u32::from(byte & 0x7F) << (7 * i);

        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if i == 3 {
            return Err(DecodeError::InvalidRemainingLength);
        }
    }

    Err(DecodeError::InsufficientData)
}

/// Write a Variable Byte Integer. Returns bytes written.
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    let mut remaining = value;
    let mut written = 0;
    loop {
        let digit = (remaining & 0x7F) as u8;
        remaining >>= 7;
        buf.put_u8(if remaining == 0 { digit } else { digit | 0x80 });
        written += 1;
        if remaining == 0 {
            return Ok(written);
        }
    }
}

/// Read a big-endian 16-bit length prefix and the bytes it covers.
/// Returns (bytes, total_consumed).
#[inline]
fn read_prefixed(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let [hi, lo, rest @ ..] = buf else {
        return Err(DecodeError::InsufficientData);
    };

    let len = usize::from(u16::from_be_bytes([*hi, *lo]));
    match rest.get(..len) {
        Some(data) => Ok((data, 2 + len)),
        None => Err(DecodeError::InsufficientData),
    }
}

/// Write a 16-bit length prefix followed by the bytes
#[inline]
fn write_prefixed(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Read a length-prefixed UTF-8 string, rejecting embedded NUL.
/// Returns (string, bytes_consumed).
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (data, consumed) = read_prefixed(buf)?;

    let s = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    if s.bytes().any(|b| b == 0) {
        return Err(DecodeError::MalformedPacket(
            "string contains null character",
        ));
    }

    Ok((s, consumed))
}

/// Read length-prefixed binary data. Returns (data, bytes_consumed).
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    read_prefixed(buf)
}

/// Write a length-prefixed UTF-8 string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_prefixed(buf, s.as_bytes())
}

/// Write length-prefixed binary data
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    write_prefixed(buf, data)
}
