/// Errors that can occur in IPC transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to create a connected socket pair.
    #[error("failed to create socket pair: {0}")]
    Pair(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The environment does not name an inherited channel descriptor.
    #[error("environment variable {var} is not set")]
    MissingFd { var: &'static str },

    /// The inherited descriptor is malformed or does not refer to a socket.
    #[error("invalid channel descriptor {value:?}: {reason}")]
    InvalidFd { value: String, reason: String },

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
