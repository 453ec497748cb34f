//! The plugrpc protocol engine.
//!
//! An [`RpcPeer`] sits on one end of a link and lets either side call
//! methods on objects living in the other process. Local objects passed
//! in arguments or results are exported into the peer's stub registry and
//! arrive on the other side as [`Proxy`] handles; calls are correlated by
//! id, so replies may arrive in any order. Releasing the last proxy (or
//! calling [`Proxy::dispose`]) sends a `finalize` so the owner can drop
//! its stub.

pub mod connection;
pub mod control;
pub mod error;
pub mod handshake;
pub mod message;
pub mod object;
pub mod peer;
pub mod proxy;
pub mod value;

pub use connection::Connection;
pub use control::{ControlChannel, ControlMessage};
pub use error::{ErrorKind, Result, RpcError};
pub use handshake::{
    child_handshake, host_handshake, is_version_compatible, parse_version, HandshakeConfig,
    HelloInfo, WelcomeInfo, PROTOCOL_NAME, PROTOCOL_VERSION,
};
pub use message::Message;
pub use object::{Call, MethodTable, RpcObject};
pub use peer::{link_error, MessageSink, RpcPeer};
pub use proxy::Proxy;
pub use value::{ObjectRef, Owner, Value, WireValue, MAX_DEPTH};
