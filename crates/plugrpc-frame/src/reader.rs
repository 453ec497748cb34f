use std::collections::VecDeque;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use plugrpc_transport::IpcStream;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::trace;

use crate::codec::{decode_frame, Frame, FrameCodec, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Something the link reader task can pull frames out of.
pub trait FrameSource: Send + 'static {
    /// Next complete frame with the handle it announced, if any.
    ///
    /// `Ok(None)` means the other side closed the stream cleanly.
    fn next_frame(
        &mut self,
    ) -> impl Future<Output = Result<Option<(Frame, Option<OwnedFd>)>>> + Send;
}

/// Reads complete frames from a socket, pairing announced handles with
/// the frames that carry them.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct SocketFrameReader {
    stream: Arc<IpcStream>,
    buf: BytesMut,
    chunk: Vec<u8>,
    handles: VecDeque<OwnedFd>,
    config: FrameConfig,
}

impl SocketFrameReader {
    pub fn new(stream: Arc<IpcStream>, config: FrameConfig) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            chunk: vec![0u8; READ_CHUNK_SIZE],
            handles: VecDeque::new(),
            config,
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub async fn read_frame(&mut self) -> Result<(Frame, Option<OwnedFd>)> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                let handle = if frame.carries_handle() {
                    Some(self.handles.pop_front().ok_or(FrameError::MissingHandle)?)
                } else {
                    None
                };
                trace!(
                    channel = frame.channel,
                    len = frame.payload.len(),
                    handle = handle.is_some(),
                    "frame received"
                );
                return Ok((frame, handle));
            }

            let read = self
                .stream
                .recv_with_handles(&mut self.chunk, &mut self.handles)
                .await?;
            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&self.chunk[..read]);
        }
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameSource for SocketFrameReader {
    async fn next_frame(&mut self) -> Result<Option<(Frame, Option<OwnedFd>)>> {
        match self.read_frame().await {
            Ok(pair) => Ok(Some(pair)),
            Err(FrameError::ConnectionClosed) if self.buf.is_empty() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Reads frames from a plain byte stream such as a child's stdio pipe.
///
/// Pipes cannot carry handles, so a frame announcing one is an error.
pub struct PipeFrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> PipeFrameReader<R> {
    pub fn new(inner: R, config: &FrameConfig) -> Self {
        Self {
            inner: FramedRead::new(inner, FrameCodec::new(config)),
        }
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: AsyncRead + Unpin + Send + 'static> FrameSource for PipeFrameReader<R> {
    async fn next_frame(&mut self) -> Result<Option<(Frame, Option<OwnedFd>)>> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Err(err)) => Err(err),
            Some(Ok(frame)) if frame.carries_handle() => Err(FrameError::HandleUnsupported),
            Some(Ok(frame)) => Ok(Some((frame, None))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, FLAG_HANDLE, MAGIC};
    use crate::channel::{CONTROL, RPC};

    fn wire(frames: &[(u8, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (channel, payload) in frames {
            encode_frame(*channel, 0, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn socket_reader_reads_multiple_frames() {
        let (left, right) = IpcStream::pair().unwrap();
        let bytes = wire(&[(CONTROL, b"hello"), (RPC, b"one"), (RPC, b"two")]);
        left.send_with_handle(&bytes, None).await.unwrap();

        let mut reader = SocketFrameReader::new(Arc::new(right), FrameConfig::default());
        let (f1, _) = reader.read_frame().await.unwrap();
        let (f2, _) = reader.read_frame().await.unwrap();
        let (f3, _) = reader.read_frame().await.unwrap();

        assert_eq!((f1.channel, f1.payload.as_ref()), (CONTROL, b"hello".as_ref()));
        assert_eq!((f2.channel, f2.payload.as_ref()), (RPC, b"one".as_ref()));
        assert_eq!((f3.channel, f3.payload.as_ref()), (RPC, b"two".as_ref()));
    }

    #[tokio::test]
    async fn socket_reader_reassembles_split_frames() {
        let (left, right) = IpcStream::pair().unwrap();
        let bytes = wire(&[(RPC, b"slow")]);
        let writer = tokio::spawn(async move {
            for byte in bytes {
                left.send_with_handle(&[byte], None).await.unwrap();
                tokio::task::yield_now().await;
            }
            left
        });

        let mut reader = SocketFrameReader::new(Arc::new(right), FrameConfig::default());
        let (frame, handle) = reader.read_frame().await.unwrap();
        assert_eq!(frame.payload.as_ref(), b"slow");
        assert!(handle.is_none());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn socket_reader_pairs_handle_with_flagged_frame() {
        let (left, right) = IpcStream::pair().unwrap();
        let (mut ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();

        let mut buf = BytesMut::new();
        encode_frame(RPC, FLAG_HANDLE, b"socket", &mut buf).unwrap();
        left.send_with_handle(&buf, Some(theirs.as_fd())).await.unwrap();
        drop(theirs);

        let mut reader = SocketFrameReader::new(Arc::new(right), FrameConfig::default());
        let (frame, handle) = reader.read_frame().await.unwrap();
        assert!(frame.carries_handle());

        let mut received = std::os::unix::net::UnixStream::from(handle.unwrap());
        received.write_all(b"ok").unwrap();
        let mut out = [0u8; 2];
        ours.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ok");
    }

    #[tokio::test]
    async fn socket_reader_reports_missing_handle() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut buf = BytesMut::new();
        encode_frame(RPC, FLAG_HANDLE, b"liar", &mut buf).unwrap();
        left.send_with_handle(&buf, None).await.unwrap();

        let mut reader = SocketFrameReader::new(Arc::new(right), FrameConfig::default());
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::MissingHandle));
    }

    #[tokio::test]
    async fn clean_eof_is_end_of_stream() {
        let (left, right) = IpcStream::pair().unwrap();
        drop(left);

        let mut reader = SocketFrameReader::new(Arc::new(right), FrameConfig::default());
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut partial = BytesMut::new();
        partial.put_slice(&MAGIC);
        partial.put_u32_le(16);
        partial.put_u8(RPC);
        partial.put_u8(0);
        partial.put_slice(b"only-part");
        left.send_with_handle(&partial, None).await.unwrap();
        drop(left);

        let mut reader = SocketFrameReader::new(Arc::new(right), FrameConfig::default());
        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn pipe_reader_reads_frames() {
        let bytes = wire(&[(CONTROL, b"hello"), (RPC, b"invoke")]);
        let mut reader = PipeFrameReader::new(std::io::Cursor::new(bytes), &FrameConfig::default());

        let (f1, _) = reader.next_frame().await.unwrap().unwrap();
        let (f2, _) = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(f1.payload.as_ref(), b"hello");
        assert_eq!(f2.payload.as_ref(), b"invoke");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pipe_reader_rejects_handle_flag() {
        let mut buf = BytesMut::new();
        encode_frame(RPC, FLAG_HANDLE, b"nope", &mut buf).unwrap();
        let mut reader =
            PipeFrameReader::new(std::io::Cursor::new(buf.to_vec()), &FrameConfig::default());

        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::HandleUnsupported));
    }

    #[tokio::test]
    async fn pipe_reader_invalid_magic() {
        let bytes = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut reader = PipeFrameReader::new(std::io::Cursor::new(bytes), &FrameConfig::default());
        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidMagic));
    }
}
