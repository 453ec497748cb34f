use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::IpcStream;

/// Environment variable naming the channel descriptor a child inherited.
pub const CHANNEL_FD_ENV: &str = "PLUGRPC_CHANNEL_FD";

/// Descriptor number the child end of a socket pair is placed on in the child.
///
/// 0-2 are stdio; 3 is the first free slot, matching what most runtimes use
/// for an inherited IPC channel.
pub const CHILD_CHANNEL_FD: RawFd = 3;

/// The end of a socket pair destined for a child process.
///
/// It stays a plain blocking descriptor with close-on-exec set; the spawner
/// is responsible for duplicating it onto [`CHILD_CHANNEL_FD`] between fork
/// and exec (see [`ChildChannel::install_as_child_fd`]).
#[derive(Debug)]
pub struct ChildChannel {
    fd: OwnedFd,
}

impl ChildChannel {
    /// Raw descriptor number in the parent process.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicate `raw` onto [`CHILD_CHANNEL_FD`] without close-on-exec.
    ///
    /// Only async-signal-safe calls are made, so this may run in a
    /// `pre_exec` hook. Takes the raw number because the hook closure must
    /// not own the descriptor.
    pub fn install_as_child_fd(raw: RawFd) -> std::io::Result<()> {
        // SAFETY: dup2/fcntl are async-signal-safe and only touch descriptor tables.
        unsafe {
            if raw == CHILD_CHANNEL_FD {
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(raw, CHILD_CHANNEL_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Create a socket pair: the async parent end and the end a child inherits.
pub fn socket_pair() -> Result<(IpcStream, ChildChannel)> {
    let (parent, child) = std::os::unix::net::UnixStream::pair().map_err(TransportError::Pair)?;
    let parent = IpcStream::from_std(parent)?;
    let child = ChildChannel {
        fd: OwnedFd::from(child),
    };
    debug!(
        parent_fd = parent.as_raw_fd(),
        child_fd = child.raw_fd(),
        "created channel socket pair"
    );
    Ok((parent, child))
}

impl IpcStream {
    /// Adopt the channel descriptor named by [`CHANNEL_FD_ENV`].
    ///
    /// Called once by a child process at startup.
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(CHANNEL_FD_ENV).map_err(|_| TransportError::MissingFd {
            var: CHANNEL_FD_ENV,
        })?;
        let raw: RawFd = value
            .trim()
            .parse()
            .map_err(|_| TransportError::InvalidFd {
                value: value.clone(),
                reason: "not a descriptor number".to_string(),
            })?;
        Self::from_inherited_fd(raw)
    }

    /// Adopt an inherited descriptor after checking it is a socket.
    ///
    /// Ownership is taken only when validation succeeds; a rejected
    /// descriptor is left open.
    pub fn from_inherited_fd(raw: RawFd) -> Result<Self> {
        if raw < 0 {
            return Err(TransportError::InvalidFd {
                value: raw.to_string(),
                reason: "negative descriptor".to_string(),
            });
        }

        // SAFETY: fstat writes into a properly sized, zeroed stat buffer.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(raw, &mut stat) };
        if rc != 0 {
            return Err(TransportError::InvalidFd {
                value: raw.to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        if stat.st_mode & libc::S_IFMT != libc::S_IFSOCK {
            return Err(TransportError::InvalidFd {
                value: raw.to_string(),
                reason: "descriptor is not a socket".to_string(),
            });
        }

        // SAFETY: the descriptor is open, refers to a socket, and the caller
        // hands us exclusive ownership of it.
        let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(raw) };
        set_cloexec(std_stream.as_raw_fd())?;
        debug!(fd = raw, "adopted inherited channel descriptor");
        Self::from_std(std_stream)
    }
}

impl IntoRawFd for ChildChannel {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

fn set_cloexec(raw: RawFd) -> Result<()> {
    // SAFETY: fcntl on an open descriptor we own.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}
