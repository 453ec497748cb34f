use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::warn;

use crate::error::Result;

/// Maximum number of descriptors accepted from a single `recvmsg` call.
pub const MAX_HANDLES_PER_READ: usize = 4;

/// A connected, non-blocking Unix stream socket.
///
/// Besides plain byte I/O, every write may carry one OS handle out of band
/// (`SCM_RIGHTS`). Handles received by [`recv_with_handles`] are queued in
/// arrival order; the framing layer pairs them with the frames that
/// announced them.
///
/// All methods take `&self`, so one stream can be shared by a reader task
/// and a writer task through an `Arc`.
///
/// [`recv_with_handles`]: IpcStream::recv_with_handles
pub struct IpcStream {
    inner: UnixStream,
}

impl IpcStream {
    /// Wrap a standard library socket. Switches it to non-blocking mode.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            inner: UnixStream::from_std(stream)?,
        })
    }

    /// Create a connected pair of streams inside the current process.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) =
            std::os::unix::net::UnixStream::pair().map_err(crate::TransportError::Pair)?;
        Ok((Self::from_std(left)?, Self::from_std(right)?))
    }

    /// Write bytes, optionally attaching one handle to the first byte written.
    ///
    /// Returns the number of bytes written, which may be less than
    /// `buf.len()`. The handle is transferred only if at least one byte was
    /// written; callers should not re-attach it on a follow-up write.
    pub async fn send_with_handle(
        &self,
        buf: &[u8],
        handle: Option<BorrowedFd<'_>>,
    ) -> io::Result<usize> {
        let raw_handle = handle.map(|fd| fd.as_raw_fd());
        loop {
            self.inner.writable().await?;
            match self.inner.try_io(Interest::WRITABLE, || {
                send_msg(self.inner.as_raw_fd(), buf, raw_handle)
            }) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Read bytes into `buf`, appending any received handles to `handles`.
    ///
    /// Returns `Ok(0)` at end of stream.
    pub async fn recv_with_handles(
        &self,
        buf: &mut [u8],
        handles: &mut VecDeque<OwnedFd>,
    ) -> io::Result<usize> {
        loop {
            self.inner.readable().await?;
            match self.inner.try_io(Interest::READABLE, || {
                recv_msg(self.inner.as_raw_fd(), &mut *buf, &mut *handles)
            }) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Shut down both directions of the socket.
    pub fn shutdown(&self) -> Result<()> {
        // SAFETY: the descriptor is owned by `self.inner` and stays open for the call.
        let rc = unsafe { libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_RDWR) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::NotConnected {
            return Ok(());
        }
        Err(err.into())
    }
}

impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("fd", &self.inner.as_raw_fd())
            .finish()
    }
}

fn cmsg_space(handles: usize) -> usize {
    // SAFETY: CMSG_SPACE is a pure size computation.
    unsafe { libc::CMSG_SPACE((handles * std::mem::size_of::<RawFd>()) as libc::c_uint) as usize }
}

/// Control-message buffer with the alignment `cmsghdr` requires.
fn cmsg_buffer(handles: usize) -> Vec<u64> {
    vec![0u64; cmsg_space(handles).div_ceil(std::mem::size_of::<u64>())]
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: libc::c_int = 0;

fn send_msg(fd: RawFd, buf: &[u8], handle: Option<RawFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    // SAFETY: an all-zero msghdr is a valid "no name, no control data" header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1 as _;

    let mut control = cmsg_buffer(1);
    if let Some(handle) = handle {
        msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
        msg.msg_controllen = cmsg_space(1) as _;

        // SAFETY: msg_control points at a zeroed, suitably aligned buffer of
        // CMSG_SPACE(sizeof(int)) bytes, so the first header and its data fit.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as libc::c_uint) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), handle);
        }
    }

    // SAFETY: `msg` references live buffers for the duration of the call.
    let written = unsafe { libc::sendmsg(fd, &msg, SEND_FLAGS) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(written as usize)
}

fn recv_msg(fd: RawFd, buf: &mut [u8], handles: &mut VecDeque<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut control = cmsg_buffer(MAX_HANDLES_PER_READ);

    // SAFETY: an all-zero msghdr is a valid starting point; fields are set below.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1 as _;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space(MAX_HANDLES_PER_READ) as _;

    // SAFETY: `msg` references live, writable buffers for the duration of the call.
    let read = unsafe { libc::recvmsg(fd, &mut msg, RECV_FLAGS) };
    if read < 0 {
        return Err(io::Error::last_os_error());
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        warn!(fd, "control data truncated; some received handles were dropped");
    }

    // SAFETY: the kernel filled `control` with well-formed cmsg headers up to
    // msg_controllen; the CMSG_* macros walk exactly that region.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let header_len = libc::CMSG_LEN(0) as usize;
                let count =
                    ((*cmsg).cmsg_len as usize).saturating_sub(header_len) / std::mem::size_of::<RawFd>();
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    #[cfg(not(target_os = "linux"))]
                    libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC);
                    handles.push_back(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(read as usize)
}
