//! The Transport Channel: an ordered duplex message stream over frames.
//!
//! A link owns two background tasks. The writer drains an unbounded queue
//! into a [`FrameSink`], so [`LinkSender::send`] never waits on I/O. The
//! reader pulls frames from a [`FrameSource`] and hands them to the
//! [`LinkReceiver`]. Either task ending closes the whole link.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use bytes::Bytes;
use plugrpc_transport::IpcStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::channel_name;
use crate::codec::{Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::reader::{FrameSource, PipeFrameReader, SocketFrameReader};
use crate::writer::{FrameSink, PipeFrameWriter, SocketFrameWriter};

/// A message delivered by the link.
#[derive(Debug)]
pub struct Inbound {
    pub channel: u8,
    pub payload: Bytes,
    pub handle: Option<OwnedFd>,
}

#[derive(Debug)]
struct Outgoing {
    channel: u8,
    payload: Bytes,
    handle: Option<OwnedFd>,
}

/// Sending half of a link. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<Outgoing>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    handles: bool,
    max_payload: usize,
}

impl LinkSender {
    /// Queue a message. Never waits for the write to happen.
    pub fn send(&self, channel: u8, payload: impl Into<Bytes>, handle: Option<OwnedFd>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(FrameError::ConnectionClosed);
        }
        if handle.is_some() && !self.handles {
            return Err(FrameError::HandleUnsupported);
        }
        let payload = payload.into();
        if payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        self.tx
            .send(Outgoing {
                channel,
                payload,
                handle,
            })
            .map_err(|_| FrameError::ConnectionClosed)
    }

    /// Close the link. Safe to call any number of times.
    ///
    /// Messages queued before the call are still written, best effort.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("closing link");
            self.shutdown.cancel();
        }
    }

    /// Whether the link has stopped delivering messages.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the link has stopped delivering messages.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether handles can be attached to sends.
    pub fn supports_handles(&self) -> bool {
        self.handles
    }

    /// Largest payload [`send`](LinkSender::send) accepts.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

/// Receiving half of a link.
#[derive(Debug)]
pub struct LinkReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl LinkReceiver {
    /// Next inbound message in arrival order. `None` once the link closed.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

/// A running link.
#[derive(Debug)]
pub struct Link {
    sender: LinkSender,
    receiver: LinkReceiver,
}

impl Link {
    /// Start the reader and writer tasks. Must be called inside a Tokio runtime.
    pub fn spawn<S, K>(source: S, sink: K, config: &FrameConfig) -> Self
    where
        S: FrameSource,
        K: FrameSink,
    {
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let handles = sink.supports_handles();
        tokio::spawn(write_loop(sink, out_rx, shutdown.clone()));
        tokio::spawn(read_loop(source, in_tx, shutdown.clone(), closed.clone()));

        Self {
            sender: LinkSender {
                tx: out_tx,
                shutdown,
                closed,
                handles,
                max_payload: config.max_payload_size,
            },
            receiver: LinkReceiver { rx: in_rx },
        }
    }

    /// A link over a connected socket; handles are supported.
    pub fn socket(stream: IpcStream, config: &FrameConfig) -> Self {
        let stream = Arc::new(stream);
        let source = SocketFrameReader::new(Arc::clone(&stream), config.clone());
        let sink = SocketFrameWriter::new(stream, config.clone());
        Self::spawn(source, sink, config)
    }

    /// A link over a pair of byte pipes; handles are not supported.
    pub fn pipe<R, W>(reader: R, writer: W, config: &FrameConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(
            PipeFrameReader::new(reader, config),
            PipeFrameWriter::new(writer, config),
            config,
        )
    }

    /// Two links connected to each other in memory. Handles are supported.
    pub fn memory_pair() -> (Self, Self) {
        let config = FrameConfig::default();
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self::spawn(MemorySource { rx: b_rx }, MemorySink { tx: Some(a_tx) }, &config);
        let b = Self::spawn(MemorySource { rx: a_rx }, MemorySink { tx: Some(b_tx) }, &config);
        (a, b)
    }

    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    pub fn split(self) -> (LinkSender, LinkReceiver) {
        (self.sender, self.receiver)
    }
}

async fn write_loop<K: FrameSink>(
    mut sink: K,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(out) => {
                    if let Err(err) = sink.write_frame(out.channel, out.payload, out.handle).await {
                        warn!(channel = channel_name(out.channel), error = %err, "link write failed");
                        shutdown.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    // Flush whatever was queued before the close.
    while let Ok(out) = rx.try_recv() {
        if sink.write_frame(out.channel, out.payload, out.handle).await.is_err() {
            break;
        }
    }
    if let Err(err) = sink.shutdown().await {
        debug!(error = %err, "link sink shutdown failed");
    }
    shutdown.cancel();
}

async fn read_loop<S: FrameSource>(
    mut source: S,
    tx: mpsc::UnboundedSender<Inbound>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = source.next_frame() => match next {
                Ok(Some((frame, handle))) => {
                    let inbound = Inbound {
                        channel: frame.channel,
                        payload: frame.payload,
                        handle,
                    };
                    if tx.send(inbound).is_err() {
                        debug!("link receiver dropped");
                        break;
                    }
                }
                Ok(None) => {
                    debug!("link closed by remote");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "link read failed");
                    break;
                }
            },
        }
    }

    shutdown.cancel();
    closed.cancel();
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<(Frame, Option<OwnedFd>)>,
}

impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Result<Option<(Frame, Option<OwnedFd>)>> {
        Ok(self.rx.recv().await)
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<(Frame, Option<OwnedFd>)>>,
}

impl FrameSink for MemorySink {
    fn supports_handles(&self) -> bool {
        true
    }

    async fn write_frame(&mut self, channel: u8, payload: Bytes, handle: Option<OwnedFd>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(FrameError::ConnectionClosed)?;
        tx.send((Frame::new(channel, payload), handle))
            .map_err(|_| FrameError::ConnectionClosed)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}
