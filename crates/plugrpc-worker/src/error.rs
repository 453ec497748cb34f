use std::path::PathBuf;

use plugrpc_peer::RpcError;

/// Errors from worker supervision and the child-side connector.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The plugin process could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The channel cannot accept writes in the worker's current state.
    #[error("channel unavailable: worker is {state}")]
    Unavailable { state: &'static str },

    /// The raw RPC stream was already handed out.
    #[error("{0} already taken")]
    AlreadyTaken(&'static str),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] plugrpc_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] plugrpc_frame::FrameError),

    /// Peer-level error.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Invalid worker configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    /// The error as seen by an RPC caller.
    pub fn into_rpc(self) -> RpcError {
        match self {
            Self::Rpc(err) => err,
            Self::Unavailable { state } => {
                RpcError::PeerDisconnected(format!("worker is {state}"))
            }
            Self::Frame(err) => plugrpc_peer::link_error(err),
            other => RpcError::Spawn(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
