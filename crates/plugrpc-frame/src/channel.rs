//! Built-in channel IDs.
//!
//! A link multiplexes two logical streams: connection management and the
//! RPC message stream. Every other value is rejected by the peer layer.

/// Connection management (handshake, shutdown).
pub const CONTROL: u8 = 0;

/// RPC messages (invoke, result, error, finalize).
pub const RPC: u8 = 1;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u8) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        RPC => "RPC",
        _ => "UNKNOWN",
    }
}
