use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The failure taxonomy shared by both ends of a connection.
///
/// Travels on the wire inside `error` replies, so renaming a variant is a
/// protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Serialization,
    RemoteThrow,
    StaleProxy,
    PeerDisconnected,
    Spawn,
    ProtocolViolation,
    Timeout,
}

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A value cannot be placed on the wire. Raised locally.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The remote method body failed.
    #[error("remote error: {message}")]
    RemoteThrow { message: String },

    /// The target object is no longer exported by its owner.
    #[error("stale proxy: object {target_id} is not exported")]
    StaleProxy { target_id: u64 },

    /// The channel closed before the call could complete.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    /// The plugin process failed to start or never completed the handshake.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Malformed message, duplicate reply, or unsupported transport feature.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] plugrpc_frame::FrameError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller gave up waiting.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

impl RpcError {
    /// A failure raised by a method body, reported to the caller as a remote throw.
    pub fn throw(message: impl Into<String>) -> Self {
        Self::RemoteThrow {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::RemoteThrow { .. } => ErrorKind::RemoteThrow,
            Self::StaleProxy { .. } => ErrorKind::StaleProxy,
            Self::PeerDisconnected(_) | Self::Frame(_) => ErrorKind::PeerDisconnected,
            Self::Spawn(_) | Self::HandshakeFailed(_) => ErrorKind::Spawn,
            Self::ProtocolViolation(_) | Self::Json(_) => ErrorKind::ProtocolViolation,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Message text as carried in an `error` reply.
    pub(crate) fn wire_message(&self) -> String {
        match self {
            Self::RemoteThrow { message } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild the caller-side error from an `error` reply.
    pub(crate) fn from_reply(kind: ErrorKind, message: String, target_id: u64) -> Self {
        match kind {
            ErrorKind::Serialization => Self::Serialization(message),
            ErrorKind::RemoteThrow => Self::RemoteThrow { message },
            ErrorKind::StaleProxy => Self::StaleProxy { target_id },
            ErrorKind::PeerDisconnected => Self::PeerDisconnected(message),
            ErrorKind::Spawn => Self::Spawn(message),
            ErrorKind::ProtocolViolation => Self::ProtocolViolation(message),
            // A remote timeout is still a failure of the remote body.
            ErrorKind::Timeout => Self::RemoteThrow { message },
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
