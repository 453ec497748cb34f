use std::fmt;
use std::io;

use plugrpc_peer::{ErrorKind, RpcError};
use plugrpc_worker::WorkerError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
/// The plugin went away mid-call.
pub const DISCONNECTED: i32 = 3;
/// The plugin's method failed.
pub const REMOTE_ERROR: i32 = 4;
/// The plugin never became ready.
pub const SPAWN_FAILED: i32 = 20;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    let code = match err.kind() {
        ErrorKind::Serialization => DATA_INVALID,
        ErrorKind::RemoteThrow | ErrorKind::StaleProxy => REMOTE_ERROR,
        ErrorKind::PeerDisconnected => DISCONNECTED,
        ErrorKind::Spawn => SPAWN_FAILED,
        ErrorKind::ProtocolViolation => INTERNAL,
        ErrorKind::Timeout => TIMEOUT,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn worker_error(context: &str, err: WorkerError) -> CliError {
    match err {
        WorkerError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
        WorkerError::Io(source) => io_error(context, source),
        WorkerError::Rpc(err) => rpc_error(context, err),
        other => rpc_error(context, other.into_rpc()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn rpc_kinds_map_to_stable_codes() {
        assert_eq!(rpc_error("x", RpcError::Spawn("no".into())).code, SPAWN_FAILED);
        assert_eq!(rpc_error("x", RpcError::throw("boom")).code, REMOTE_ERROR);
        assert_eq!(
            rpc_error("x", RpcError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            rpc_error("x", RpcError::PeerDisconnected("gone".into())).code,
            DISCONNECTED
        );
    }

    #[test]
    fn bad_config_is_a_usage_error() {
        let err = worker_error("load", WorkerError::Config("empty program".into()));
        assert_eq!(err.code, USAGE);
        assert!(err.message.starts_with("load: "));
    }
}
