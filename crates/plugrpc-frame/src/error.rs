/// Errors that can occur during frame encoding/decoding and link I/O.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x5052 \"PR\")")]
    InvalidMagic,

    /// The frame header sets flag bits this version does not understand.
    #[error("unknown frame flags 0x{0:02x}")]
    InvalidFlags(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A frame announced a handle but none arrived with it.
    #[error("frame announced a handle that was not received")]
    MissingHandle,

    /// A handle was attached on a link that cannot carry handles.
    #[error("link cannot carry OS handles")]
    HandleUnsupported,

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] plugrpc_transport::TransportError),

    /// The connection was closed before a complete frame was received, or
    /// a send was attempted after the link closed.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
