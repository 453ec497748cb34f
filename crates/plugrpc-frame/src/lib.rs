//! Length-prefixed message framing and the duplex link for plugrpc.
//!
//! Every message is framed with:
//! - A 2-byte magic number ("PR") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 1-byte channel ID (CONTROL or RPC)
//! - A 1-byte flags field (bit 0: an OS handle travels with this frame)
//!
//! On top of the codec, [`Link`] is the Transport Channel: an ordered duplex
//! message stream with non-blocking sends, optional handle passing, and an
//! idempotent close that is observed exactly once by the receiving side.

pub mod channel;
pub mod codec;
pub mod error;
pub mod link;
pub mod reader;
pub mod writer;

pub use channel::{channel_name, CONTROL, RPC};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameCodec, FrameConfig, DEFAULT_MAX_PAYLOAD, FLAG_HANDLE,
    HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use link::{Inbound, Link, LinkReceiver, LinkSender};
pub use reader::{FrameSource, PipeFrameReader, SocketFrameReader};
pub use writer::{FrameSink, PipeFrameWriter, SocketFrameWriter};
