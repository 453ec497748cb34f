use bytes::Bytes;
use plugrpc_frame::{LinkSender, CONTROL};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, RpcError};
use crate::peer::link_error;
use crate::value::ObjectRef;

/// CONTROL channel message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message of a child: who it is and what it exports.
    Hello {
        protocol: String,
        version: String,
        pid: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<ObjectRef>,
    },
    /// Host accepted the hello.
    Welcome {
        protocol: String,
        version: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<ObjectRef>,
    },
    /// Host refused the hello; the child should exit.
    Reject { reason: String },
    /// Graceful stop request.
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ControlMessage {
    /// Create a shutdown request.
    pub fn shutdown(reason: Option<&str>) -> Self {
        Self::Shutdown {
            reason: reason.map(str::to_string),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Welcome { .. } => "welcome",
            Self::Reject { .. } => "reject",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// The CONTROL half of a link: send side plus the queue of raw CONTROL payloads.
#[derive(Debug)]
pub struct ControlChannel {
    sender: LinkSender,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ControlChannel {
    pub fn new(sender: LinkSender, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { sender, rx }
    }

    pub fn send(&self, message: &ControlMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.sender
            .send(CONTROL, payload, None)
            .map_err(link_error)
    }

    /// Next raw CONTROL payload; `None` once the link closed.
    pub async fn recv_raw(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next CONTROL message, refusing payloads larger than `max_payload`.
    pub async fn recv(&mut self, max_payload: usize) -> Result<ControlMessage> {
        let payload = self.recv_raw().await.ok_or_else(|| {
            RpcError::PeerDisconnected("link closed on control channel".to_string())
        })?;
        if payload.len() > max_payload {
            return Err(RpcError::ProtocolViolation(format!(
                "control payload too large: {} (max {})",
                payload.len(),
                max_payload
            )));
        }
        Ok(serde_json::from_slice(&payload)?)
    }

    pub fn sender(&self) -> &LinkSender {
        &self.sender
    }

    /// Close the whole link.
    pub fn close(&self) {
        self.sender.close();
    }
}
