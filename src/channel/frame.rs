//! Wire format for multiplexed channels
//!
//! ```text
//! +------+----------+-------------+----------------+---------+
//! | kind | name_len | payload_len |      name      | payload |
//! |  u8  |    u8    |  u32 (BE)   | name_len bytes |  bytes  |
//! +------+----------+-------------+----------------+---------+
//! ```
//!
//! `Yield` and `Continue` carry no payload.

use crate::{
    errors::{Error, Result},
    queue::ByteQueue,
};
use bytes::Bytes;

pub const HEADER_LEN: usize = 6;
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;
pub const MAX_NAME: usize = u8::MAX as usize;

/// `true` for channel names a frame can carry: 1 to [`MAX_NAME`] bytes.
#[inline]
pub fn is_valid_name(name: &str) -> bool {
    (1..=MAX_NAME).contains(&name.len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Application bytes for a channel.
    Data = 0,
    /// Asks the receiver to stop sending on a channel.
    Yield = 1,
    /// Lifts an earlier `Yield`.
    Continue = 2,
}

impl FrameKind {
    #[inline]
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::Yield),
            2 => Some(FrameKind::Continue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub name: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub fn signal(kind: FrameKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            payload: Bytes::new(),
        }
    }

    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.name.len() + self.payload.len()
    }

    /// Appends the encoded frame to `out`.
    ///
    /// Fails with [`Error::MalformedFrame`] for names that are empty or
    /// longer than 255 bytes, oversized payloads and control frames with
    /// a payload.
    pub fn encode(&self, out: &mut ByteQueue) -> Result<()> {
        let name = self.name.as_bytes();
        if !is_valid_name(&self.name) || self.payload.len() > MAX_PAYLOAD {
            return Err(Error::MalformedFrame);
        }
        if self.kind != FrameKind::Data && !self.payload.is_empty() {
            return Err(Error::MalformedFrame);
        }

        let mut header = [0u8; HEADER_LEN];
        header[0] = self.kind as u8;
        header[1] = name.len() as u8;
        header[2..].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());

        out.add(&header);
        out.add(name);
        out.add(&self.payload);
        Ok(())
    }

    /// Removes one complete frame from the front of `input`.
    ///
    /// Returns `Ok(None)` and leaves `input` untouched until the whole frame
    /// is buffered. A malformed header fails as soon as it is visible.
    pub fn decode(input: &mut ByteQueue) -> Result<Option<Frame>> {
        let Some(header) = input.as_slice().get(..HEADER_LEN) else {
            return Ok(None);
        };

        let kind = FrameKind::from_u8(header[0]).ok_or(Error::MalformedFrame)?;
        let name_len = header[1] as usize;
        let payload_len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;

        if name_len == 0 || payload_len > MAX_PAYLOAD {
            return Err(Error::MalformedFrame);
        }
        if kind != FrameKind::Data && payload_len != 0 {
            return Err(Error::MalformedFrame);
        }

        let total = HEADER_LEN + name_len + payload_len;
        if input.len() < total {
            return Ok(None);
        }

        let name = &input.as_slice()[HEADER_LEN..HEADER_LEN + name_len];
        let name = simdutf8::basic::from_utf8(name)
            .map_err(|_| Error::MalformedFrame)?
            .to_owned();

        input.remove(HEADER_LEN + name_len);
        let payload = input.remove_exact(payload_len).ok_or(Error::MalformedFrame)?;

        Ok(Some(Frame {
            kind,
            name,
            payload,
        }))
    }
}
