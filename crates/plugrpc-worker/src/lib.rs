//! Plugin process supervision for plugrpc.
//!
//! - [`RuntimeWorker`]: spawns one plugin process with an inherited channel,
//!   exposes its stdio, lifecycle state and events, and carries RPC traffic
//! - [`PluginSession`]: pairs a worker with a host [`RpcPeer`](plugrpc_peer::RpcPeer),
//!   runs the handshake and tears the peer down when the process ends
//! - [`child`]: what a plugin binary calls to attach to its host

pub mod child;
pub mod error;
pub mod event;
pub mod options;
pub mod session;
pub mod worker;

pub use child::{connect_from_env, ChildConnection};
pub use error::{Result, WorkerError};
pub use event::{TerminationReason, WorkerEvent, WorkerState};
pub use options::{DebugOptions, PluginPayload, WorkerOptions};
pub use session::{PluginSession, SessionConfig, SessionState};
pub use worker::{RuntimeWorker, SendContext};
