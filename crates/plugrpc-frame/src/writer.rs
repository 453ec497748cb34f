use std::future::Future;
use std::io::ErrorKind;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::SinkExt;
use plugrpc_transport::IpcStream;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;
use tracing::trace;

use crate::codec::{encode_frame, Frame, FrameCodec, FrameConfig, FLAG_HANDLE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Something the link writer task can push frames into.
pub trait FrameSink: Send + 'static {
    /// Whether [`write_frame`](FrameSink::write_frame) accepts a handle.
    fn supports_handles(&self) -> bool;

    /// Write one complete frame, optionally transferring `handle` with it.
    fn write_frame(
        &mut self,
        channel: u8,
        payload: Bytes,
        handle: Option<OwnedFd>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Stop writing. Further frames are not expected.
    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Writes complete frames to a socket.
///
/// A handle rides along with the first chunk of its frame; the receiving
/// [`SocketFrameReader`](crate::SocketFrameReader) queues it until the
/// flagged frame is decoded.
pub struct SocketFrameWriter {
    stream: Arc<IpcStream>,
    buf: BytesMut,
    config: FrameConfig,
}

impl SocketFrameWriter {
    pub fn new(stream: Arc<IpcStream>, config: FrameConfig) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameSink for SocketFrameWriter {
    fn supports_handles(&self) -> bool {
        true
    }

    async fn write_frame(
        &mut self,
        channel: u8,
        payload: Bytes,
        handle: Option<OwnedFd>,
    ) -> Result<()> {
        if payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        let flags = if handle.is_some() { FLAG_HANDLE } else { 0 };
        self.buf.clear();
        encode_frame(channel, flags, &payload, &mut self.buf)?;

        let mut offset = 0usize;
        let mut pending_handle = handle;
        while offset < self.buf.len() {
            let attach = pending_handle.as_ref().map(|fd| fd.as_fd());
            let written = self
                .stream
                .send_with_handle(&self.buf[offset..], attach)
                .await;
            match written {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    offset += n;
                    // The kernel duplicated the descriptor; ours can go.
                    pending_handle = None;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    return Err(FrameError::ConnectionClosed)
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        trace!(channel, len = payload.len(), flags, "frame sent");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown()?;
        Ok(())
    }
}

/// Writes frames to a plain byte stream such as a child's stdin.
pub struct PipeFrameWriter<W> {
    inner: FramedWrite<W, FrameCodec>,
}

impl<W: AsyncWrite + Unpin> PipeFrameWriter<W> {
    pub fn new(inner: W, config: &FrameConfig) -> Self {
        Self {
            inner: FramedWrite::new(inner, FrameCodec::new(config)),
        }
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> FrameSink for PipeFrameWriter<W> {
    fn supports_handles(&self) -> bool {
        false
    }

    async fn write_frame(
        &mut self,
        channel: u8,
        payload: Bytes,
        handle: Option<OwnedFd>,
    ) -> Result<()> {
        if handle.is_some() {
            return Err(FrameError::HandleUnsupported);
        }
        self.inner.send(Frame::new(channel, payload)).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.close().await
    }
}
