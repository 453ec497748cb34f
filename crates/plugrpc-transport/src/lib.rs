//! Unix socket transport for plugrpc.
//!
//! Provides the byte-level half of the Transport Channel:
//! - [`IpcStream`]: a non-blocking Unix stream socket that can carry one
//!   OS handle (file descriptor) alongside a write, via `SCM_RIGHTS`
//! - socket pairs whose second end is inherited by a spawned child process
//!
//! This is the lowest layer of plugrpc. Framing lives in `plugrpc-frame`.

pub mod error;

#[cfg(unix)]
pub mod stream;
#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};

#[cfg(unix)]
pub use stream::{IpcStream, MAX_HANDLES_PER_READ};
#[cfg(unix)]
pub use uds::{socket_pair, ChildChannel, CHANNEL_FD_ENV, CHILD_CHANNEL_FD};
