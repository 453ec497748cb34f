use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::value::WireValue;

/// A message on the RPC channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Call `method` on the receiver's object `target_id`.
    Invoke {
        call_id: u64,
        target_id: u64,
        method: String,
        args: Vec<WireValue>,
    },
    /// Successful reply to an `Invoke`.
    Result { call_id: u64, value: WireValue },
    /// Failed reply to an `Invoke`.
    Error {
        call_id: u64,
        kind: ErrorKind,
        message: String,
    },
    /// The sender holds no more proxies for `target_id` at `generation`.
    Finalize { target_id: u64, generation: u64 },
}

impl Message {
    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Invoke { .. } => "invoke",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Finalize { .. } => "finalize",
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
