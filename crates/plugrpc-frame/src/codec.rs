use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + channel (1) + flags (1) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "PR" (0x50 0x52).
pub const MAGIC: [u8; 2] = [0x50, 0x52];

/// Flag bit: one OS handle was sent alongside this frame.
pub const FLAG_HANDLE: u8 = 0x01;

const KNOWN_FLAGS: u8 = FLAG_HANDLE;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A framed message with channel routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this message belongs to.
    pub channel: u8,
    /// Header flags.
    pub flags: u8,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with no flags set.
    pub fn new(channel: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            flags: 0,
            payload: payload.into(),
        }
    }

    /// Whether the header announces an attached handle.
    pub fn carries_handle(&self) -> bool {
        self.flags & FLAG_HANDLE != 0
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬─────────┬───────┬────────────────┐
/// │ Magic (2B)   │ Length    │ Channel │ Flags │ Payload        │
/// │ 0x50 0x52    │ (4B LE)   │ (1B)    │ (1B)  │ (Length bytes) │
/// │ "PR"         │           │         │       │                │
/// └──────────────┴───────────┴─────────┴───────┴────────────────┘
/// ```
pub fn encode_frame(channel: u8, flags: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    if flags & !KNOWN_FLAGS != 0 {
        return Err(FrameError::InvalidFlags(flags));
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u8(channel);
    dst.put_u8(flags);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let channel = src[6];
    let flags = src[7];

    if flags & !KNOWN_FLAGS != 0 {
        return Err(FrameError::InvalidFlags(flags));
    }

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        channel,
        flags,
        payload,
    }))
}

/// Configuration for framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// `tokio_util` codec for byte-stream links (pipes) that cannot carry handles.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            max_payload_size: config.max_payload_size,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(&FrameConfig::default())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.max_payload_size)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload_size,
            });
        }
        encode_frame(frame.channel, frame.flags, &frame.payload, dst)
    }
}
