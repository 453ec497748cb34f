//! Out-of-process plugins with object-capability RPC.
//!
//! A host spawns each plugin as a child process, hands it one end of a
//! socket pair, and the two sides call methods on each other's objects
//! through [`peer::RpcPeer`]. Objects passed by value become remote proxies
//! on the other side; replies are matched by correlation id.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix socket stream with handle passing
//! - [`frame`]: length-prefixed framing and the `Link` message channel
//! - [`peer`]: the RPC protocol engine, handshake and control messages
//! - [`worker`]: plugin process supervision and sessions (behind `worker` feature)

/// Re-export transport types.
pub mod transport {
    pub use plugrpc_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use plugrpc_frame::*;
}

/// Re-export peer types.
pub mod peer {
    pub use plugrpc_peer::*;
}

/// Re-export worker types (requires `worker` feature).
#[cfg(feature = "worker")]
pub mod worker {
    pub use plugrpc_worker::*;
}
