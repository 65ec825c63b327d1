//! Payload of the OpenSSH `direct-streamlocal@openssh.com` channel-open request.
//!
//! ```text
//! string  socket path
//! string  reserved
//! uint32  reserved
//! ```
//!
//! Strings are a big-endian `uint32` length followed by that many bytes.
//!
//! The bytes on the wire are written by russh's
//! `channel_open_direct_streamlocal`, which uses this same layout. The types
//! here do not send anything; [`crate::channel`] only uses them to log the
//! request size.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const CHANNEL_TYPE: &str = "direct-streamlocal@openssh.com";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("payload truncated: needed {needed} more bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },
    #[error("socket path is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("string of {0} bytes does not fit a uint32 length")]
    TooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLocalOpen {
    pub socket_path: String,
    pub reserved: String,
    pub reserved_port: u32,
}

impl StreamLocalOpen {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            reserved: String::new(),
            reserved_port: 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.socket_path.len() + 4 + self.reserved.len() + 4
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        put_string(&mut buf, self.socket_path.as_bytes())?;
        put_string(&mut buf, self.reserved.as_bytes())?;
        buf.put_u32(self.reserved_port);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        let socket_path = get_string(&mut buf)?;
        let reserved = get_string(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(WireError::Truncated { needed: 4, remaining: buf.remaining() });
        }
        let reserved_port = buf.get_u32();
        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }
        Ok(Self { socket_path, reserved, reserved_port })
    }
}

fn put_string(buf: &mut BytesMut, value: &[u8]) -> Result<(), WireError> {
    let len = u32::try_from(value.len()).map_err(|_| WireError::TooLong(value.len()))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

fn get_string(buf: &mut &[u8]) -> Result<String, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated { needed: 4, remaining: buf.remaining() });
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated { needed: len, remaining: buf.remaining() });
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
}
