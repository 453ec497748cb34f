use std::time::Duration;

use tracing::{debug, warn};

use crate::control::{ControlChannel, ControlMessage};
use crate::error::{Result, RpcError};
use crate::value::{ObjectRef, Owner};

/// Protocol name spoken on the CONTROL channel.
pub const PROTOCOL_NAME: &str = "plugrpc";
/// Local protocol version, `<major>.<minor>`.
pub const PROTOCOL_VERSION: &str = "1.0";

const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_SESSION_ID_LEN: usize = 128;
const MAX_REASON_LEN: usize = 1024;

/// Configuration for handshake negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// How long to wait for the other side's message.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            max_handshake_payload: 16 * 1024,
        }
    }
}

/// What the host learns from a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloInfo {
    pub protocol_version: String,
    pub pid: u32,
    /// The child's root object, exported by the child.
    pub root: Option<ObjectRef>,
}

/// What the child learns from a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeInfo {
    pub session_id: String,
    pub protocol_version: String,
    /// The host's API object, if the host exported one.
    pub root: Option<ObjectRef>,
}

/// Child side: send `hello`, wait for `welcome`.
pub async fn child_handshake(
    control: &mut ControlChannel,
    config: &HandshakeConfig,
    pid: u32,
    root: Option<ObjectRef>,
) -> Result<WelcomeInfo> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;

    control.send(&ControlMessage::Hello {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        pid,
        root,
    })?;

    let reply = tokio::time::timeout(
        config.timeout,
        control.recv(config.max_handshake_payload),
    )
    .await
    .map_err(|_| RpcError::Timeout(config.timeout))??;

    match reply {
        ControlMessage::Welcome {
            protocol,
            version,
            session_id,
            root,
        } => {
            validate_protocol_name(&protocol)?;
            validate_version(&version)?;
            validate_session_id(&session_id)?;
            if protocol != config.protocol_name {
                return Err(RpcError::HandshakeFailed(format!(
                    "unknown protocol '{}' (expected '{}')",
                    protocol, config.protocol_name
                )));
            }
            if !is_version_compatible(&config.protocol_version, &version)? {
                return Err(RpcError::HandshakeFailed(format!(
                    "incompatible version '{}' (local '{}')",
                    version, config.protocol_version
                )));
            }
            if root.is_some_and(|root| root.owner != Owner::Sender) {
                return Err(RpcError::HandshakeFailed(
                    "host root must be an object exported by the host".to_string(),
                ));
            }
            debug!(session_id = %session_id, version = %version, "handshake accepted");
            Ok(WelcomeInfo {
                session_id,
                protocol_version: version,
                root,
            })
        }
        ControlMessage::Reject { reason } => Err(RpcError::HandshakeFailed(format!(
            "rejected by host: {}",
            truncate(&reason, MAX_REASON_LEN)
        ))),
        other => Err(RpcError::HandshakeFailed(format!(
            "expected welcome, got {}",
            other.type_name()
        ))),
    }
}

/// Host side: wait for `hello`, validate it, answer `welcome` or `reject`.
///
/// `host_root` is handed to the child in the `welcome`.
pub async fn host_handshake(
    control: &mut ControlChannel,
    config: &HandshakeConfig,
    session_id: &str,
    host_root: Option<ObjectRef>,
) -> Result<HelloInfo> {
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_session_id(session_id)?;

    let first = tokio::time::timeout(
        config.timeout,
        control.recv(config.max_handshake_payload),
    )
    .await
    .map_err(|_| RpcError::Timeout(config.timeout))??;

    let hello = match check_hello(config, first) {
        Ok(hello) => hello,
        Err(err) => {
            warn!(session_id, error = %err, "rejecting plugin handshake");
            let reason = err.to_string();
            if let Err(send_err) = control.send(&ControlMessage::Reject { reason }) {
                debug!(error = %send_err, "reject not delivered");
            }
            return Err(err);
        }
    };

    control.send(&ControlMessage::Welcome {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        session_id: session_id.to_string(),
        root: host_root,
    })?;
    debug!(session_id, pid = hello.pid, version = %hello.protocol_version, "handshake complete");
    Ok(hello)
}

fn check_hello(config: &HandshakeConfig, message: ControlMessage) -> Result<HelloInfo> {
    let (protocol, version, pid, root) = match message {
        ControlMessage::Hello {
            protocol,
            version,
            pid,
            root,
        } => (protocol, version, pid, root),
        other => {
            return Err(RpcError::HandshakeFailed(format!(
                "expected hello, got {}",
                other.type_name()
            )))
        }
    };

    validate_protocol_name(&protocol)?;
    validate_version(&version)?;

    if protocol != config.protocol_name {
        return Err(RpcError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            protocol, config.protocol_name
        )));
    }
    if !is_version_compatible(&version, &config.protocol_version)? {
        return Err(RpcError::HandshakeFailed(format!(
            "incompatible version '{}' (host '{}')",
            version, config.protocol_version
        )));
    }
    if let Some(root) = &root {
        if root.owner != Owner::Sender {
            return Err(RpcError::HandshakeFailed(
                "root must be an object exported by the plugin".to_string(),
            ));
        }
    }

    Ok(HelloInfo {
        protocol_version: version,
        pid,
        root,
    })
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(RpcError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(RpcError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    parse_version(version)?;
    Ok(())
}

fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(RpcError::HandshakeFailed(format!(
            "invalid session_id length: {}",
            session_id.len()
        )));
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Majors must match and the child may not be older than the host.
pub fn is_version_compatible(child_version: &str, host_version: &str) -> Result<bool> {
    let (child_major, child_minor) = parse_version(child_version)?;
    let (host_major, host_minor) = parse_version(host_version)?;

    Ok(child_major == host_major && child_minor >= host_minor)
}

/// Parse `<major>.<minor>`.
pub fn parse_version(version: &str) -> Result<(u16, u16)> {
    let mut parts = version.split('.');

    let major = parts.next().ok_or_else(|| {
        RpcError::HandshakeFailed(format!("invalid version '{}': missing major", version))
    })?;
    let minor = parts.next().ok_or_else(|| {
        RpcError::HandshakeFailed(format!("invalid version '{}': missing minor", version))
    })?;

    if parts.next().is_some() {
        return Err(RpcError::HandshakeFailed(format!(
            "invalid version '{}': expected '<major>.<minor>'",
            version
        )));
    }

    let major = major.parse::<u16>().map_err(|_| {
        RpcError::HandshakeFailed(format!("invalid version '{}': non-numeric major", version))
    })?;
    let minor = minor.parse::<u16>().map_err(|_| {
        RpcError::HandshakeFailed(format!("invalid version '{}': non-numeric minor", version))
    })?;

    Ok((major, minor))
}
