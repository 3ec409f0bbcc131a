//! Length-prefixed framing for the control channel.
//!
//! Each frame is `<decimal-length>:<payload>`, where the length is the exact
//! byte count of the payload. The decoder keeps partial input buffered, so
//! it is indifferent to how the underlying stream chunks its bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Separator between the length prefix and the payload.
pub const SEPARATOR: u8 = b':';

/// Longest length prefix accepted before a separator must appear.
const MAX_PREFIX_LEN: usize = 20;

/// Default upper bound for one frame's payload (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        let Some(separator) = src.iter().position(|&b| b == SEPARATOR) else {
            if src.len() > MAX_PREFIX_LEN {
                return Err(invalid(format!(
                    "no frame separator within {} bytes",
                    MAX_PREFIX_LEN
                )));
            }
            if let Some(bad) = src.iter().find(|b| !b.is_ascii_digit()) {
                return Err(invalid(format!("unexpected byte {:#04x} in frame length", bad)));
            }
            return Ok(None);
        };

        let prefix = &src[..separator];
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
            return Err(invalid("frame length is not a decimal number".into()));
        }
        let payload_len: usize = std::str::from_utf8(prefix)
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| invalid("frame length out of range".into()))?;

        if payload_len > self.max_frame_len {
            return Err(invalid(format!(
                "frame length {} exceeds maximum {}",
                payload_len, self.max_frame_len
            )));
        }

        let total_len = separator + 1 + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(separator + 1);
        Ok(Some(src.split_to(payload_len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        if payload.len() > self.max_frame_len {
            return Err(invalid(format!(
                "frame length {} exceeds maximum {}",
                payload.len(),
                self.max_frame_len
            )));
        }
        let prefix = payload.len().to_string();
        dst.reserve(prefix.len() + 1 + payload.len());
        dst.put_slice(prefix.as_bytes());
        dst.put_u8(SEPARATOR);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Serialize a value as the JSON payload of one frame.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(value).map(Bytes::from)
}
