//! Supervision of one plugin process.
//!
//! The child inherits one end of a socket pair on fd 3. Everything the
//! child writes there is routed by channel: RPC frames feed the bound
//! [`RpcPeer`] (or the raw RPC stream), CONTROL frames feed the handshake.

use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use plugrpc_frame::{channel_name, FrameConfig, Inbound, Link, LinkReceiver, LinkSender, CONTROL, RPC};
use plugrpc_peer::{ControlChannel, ControlMessage, Message, MessageSink, RpcError, RpcPeer};
use plugrpc_transport::{socket_pair, ChildChannel, IpcStream, CHANNEL_FD_ENV, CHILD_CHANNEL_FD};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, WorkerError};
use crate::event::{EventHub, TerminationReason, WorkerEvent, WorkerState};
use crate::options::WorkerOptions;

/// Opaque hint attached to a send. Only logged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendContext(pub serde_json::Value);

/// Handle to one supervised plugin process. Cheap to clone.
///
/// Dropping the handle does not stop the process; use
/// [`kill`](RuntimeWorker::kill) or [`shutdown`](RuntimeWorker::shutdown).
#[derive(Clone)]
pub struct RuntimeWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    program: String,
    pid: Option<u32>,
    link: Option<LinkSender>,
    frame: FrameConfig,
    state: watch::Sender<WorkerState>,
    events: EventHub,
    kill_requested: AtomicBool,
    kill: Notify,
    closed: CancellationToken,
    stdout: Mutex<Option<ChildStdout>>,
    stderr: Mutex<Option<ChildStderr>>,
    rpc_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    peer: Mutex<Option<RpcPeer>>,
}

impl RuntimeWorker {
    /// Start the plugin process. Must be called inside a Tokio runtime.
    ///
    /// Never fails directly: a process that cannot be started leaves the
    /// worker `Terminated(Crashed)` with an `error` event followed by
    /// `close`.
    pub fn spawn(options: WorkerOptions) -> Self {
        let program = options.program.display().to_string();
        let frame = options.frame_config();
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let (mut child, stream) = match launch(&options) {
            Ok(launched) => launched,
            Err(err) => {
                warn!(program = %program, error = %err, "worker spawn failed");
                let inner = Arc::new(WorkerInner::new(program, None, None, frame, rpc_rx, control_rx));
                inner.events.emit(WorkerEvent::Error(err.to_string()));
                inner.terminate(TerminationReason::Crashed(err.to_string()));
                inner.closed.cancel();
                inner.events.finish(WorkerEvent::Close {
                    code: None,
                    signal: None,
                });
                return Self { inner };
            }
        };

        let (sender, receiver) = Link::socket(stream, &frame).split();
        let pid = child.id();
        let inner = Arc::new(WorkerInner::new(
            program,
            pid,
            Some(sender),
            frame,
            rpc_rx,
            control_rx,
        ));
        *inner.stdout.lock() = child.stdout.take();
        *inner.stderr.lock() = child.stderr.take();
        info!(pid, program = %inner.program, "worker spawned");

        tokio::spawn(route_inbound(Arc::clone(&inner), receiver, rpc_tx, control_tx));
        tokio::spawn(supervise(Arc::clone(&inner), child, options.exit_grace()));
        Self { inner }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn program(&self) -> &str {
        &self.inner.program
    }

    pub fn state(&self) -> WorkerState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to lifecycle events. The stream ends after `close`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// The child's stdout, for logging. `None` once taken.
    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.inner.stdout.lock().take()
    }

    /// The child's stderr, for logging. `None` once taken.
    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.inner.stderr.lock().take()
    }

    /// Whether handles can travel with sends to this worker.
    pub fn supports_handles(&self) -> bool {
        self.inner
            .link
            .as_ref()
            .is_some_and(LinkSender::supports_handles)
    }

    /// Send one RPC message to the child.
    ///
    /// Fails with [`WorkerError::Unavailable`] unless the worker is connected.
    pub fn send(&self, message: &Message, handle: Option<OwnedFd>) -> Result<()> {
        let payload = message.to_bytes().map_err(RpcError::from)?;
        self.inner.send_payload(Bytes::from(payload), handle)
    }

    /// Send one RPC message, routing any failure to `on_rejected`.
    pub fn send_or_reject(
        &self,
        message: &Message,
        handle: Option<OwnedFd>,
        on_rejected: impl FnOnce(WorkerError),
        context: Option<&SendContext>,
    ) {
        if let Some(context) = context {
            trace!(pid = self.inner.pid, kind = message.kind_name(), context = ?context, "send");
        }
        if let Err(err) = self.send(message, handle) {
            debug!(pid = self.inner.pid, kind = message.kind_name(), error = %err, "send rejected");
            on_rejected(err);
        }
    }

    /// Bind `peer` to this worker's RPC traffic.
    ///
    /// Messages that arrived earlier are delivered first. The peer is
    /// closed when the channel closes. Only one peer (or one raw RPC
    /// stream) can be bound.
    pub fn setup_rpc_peer(&self, peer: &RpcPeer) -> Result<()> {
        let mut rx = self
            .inner
            .rpc_rx
            .lock()
            .take()
            .ok_or(WorkerError::AlreadyTaken("rpc stream"))?;
        *self.inner.peer.lock() = Some(peer.clone());

        let peer = peer.clone();
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                peer.dispatch_payload(&inbound.payload, inbound.handle);
            }
            peer.close("plugin channel closed");
        });
        Ok(())
    }

    /// Create a peer that writes through this worker and bind it.
    pub fn create_peer(&self, name: impl Into<String>) -> Result<RpcPeer> {
        let peer = RpcPeer::new(
            name,
            WorkerSink {
                inner: Arc::downgrade(&self.inner),
                handles: self.supports_handles(),
                max_payload: self.inner.frame.max_payload_size,
            },
        );
        self.setup_rpc_peer(&peer)?;
        Ok(peer)
    }

    /// Raw inbound RPC messages, for callers that do not use an [`RpcPeer`].
    pub fn take_rpc_events(&self) -> Result<mpsc::UnboundedReceiver<Inbound>> {
        self.inner
            .rpc_rx
            .lock()
            .take()
            .ok_or(WorkerError::AlreadyTaken("rpc stream"))
    }

    /// The CONTROL channel, used for the handshake. Can be taken once.
    pub fn take_control(&self) -> Result<ControlChannel> {
        let sender = self.inner.link.clone().ok_or(WorkerError::Unavailable {
            state: self.inner.state_name(),
        })?;
        let rx = self
            .inner
            .control_rx
            .lock()
            .take()
            .ok_or(WorkerError::AlreadyTaken("control channel"))?;
        Ok(ControlChannel::new(sender, rx))
    }

    /// Forcibly stop the process. Idempotent; always followed by `exit` and `close`.
    pub fn kill(&self) {
        if self.inner.state.borrow().is_terminated() {
            return;
        }
        if !self.inner.kill_requested.swap(true, Ordering::AcqRel) {
            info!(pid = self.inner.pid, "killing worker");
            self.inner.kill.notify_one();
        }
    }

    /// Ask the child to stop, then kill it if it has not exited within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> TerminationReason {
        if let Some(link) = &self.inner.link {
            let request = ControlMessage::shutdown(Some("host requested shutdown"));
            let sent = serde_json::to_vec(&request)
                .map_err(|err| err.to_string())
                .and_then(|payload| link.send(CONTROL, payload, None).map_err(|err| err.to_string()));
            if let Err(err) = sent {
                debug!(pid = self.inner.pid, error = %err, "shutdown request not sent");
            }
        }

        if tokio::time::timeout(grace, self.wait_closed()).await.is_err() {
            warn!(pid = self.inner.pid, ?grace, "worker ignored shutdown request");
            self.kill();
        }
        self.wait_closed().await
    }

    /// Wait for the process to terminate.
    pub async fn wait_terminated(&self) -> TerminationReason {
        let mut state = self.inner.state.subscribe();
        loop {
            if let Some(reason) = state.borrow_and_update().termination() {
                return reason.clone();
            }
            if state.changed().await.is_err() {
                return TerminationReason::Crashed("worker state lost".to_string());
            }
        }
    }

    /// Wait until the process terminated and its channel is closed.
    pub async fn wait_closed(&self) -> TerminationReason {
        self.inner.closed.cancelled().await;
        self.wait_terminated().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl std::fmt::Debug for RuntimeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeWorker")
            .field("program", &self.inner.program)
            .field("pid", &self.inner.pid)
            .field("state", &self.inner.state_name())
            .finish()
    }
}

impl WorkerInner {
    fn new(
        program: String,
        pid: Option<u32>,
        link: Option<LinkSender>,
        frame: FrameConfig,
        rpc_rx: mpsc::UnboundedReceiver<Inbound>,
        control_rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            program,
            pid,
            link,
            frame,
            state: watch::Sender::new(WorkerState::Spawning),
            events: EventHub::new(),
            kill_requested: AtomicBool::new(false),
            kill: Notify::new(),
            closed: CancellationToken::new(),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
            rpc_rx: Mutex::new(Some(rpc_rx)),
            control_rx: Mutex::new(Some(control_rx)),
            peer: Mutex::new(None),
        }
    }

    fn state_name(&self) -> &'static str {
        self.state.borrow().name()
    }

    fn send_payload(&self, payload: Bytes, handle: Option<OwnedFd>) -> Result<()> {
        let state = self.state_name();
        let link = match &self.link {
            Some(link) if state == "connected" => link,
            _ => return Err(WorkerError::Unavailable { state }),
        };
        link.send(RPC, payload, handle)?;
        Ok(())
    }

    fn mark_connected(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == WorkerState::Spawning {
                *state = WorkerState::Connected;
                true
            } else {
                false
            }
        });
        if changed {
            info!(pid = self.pid, "worker connected");
        }
    }

    /// Move to `Terminated`. No transition leaves it.
    fn terminate(&self, reason: TerminationReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminated() {
                false
            } else {
                *state = WorkerState::Terminated { reason };
                true
            }
        })
    }
}

fn launch(options: &WorkerOptions) -> Result<(Child, IpcStream)> {
    options.validate()?;
    let (parent, child_end) = socket_pair()?;

    let mut command = Command::new(&options.program);
    command
        .args(&options.args)
        .envs(&options.env)
        .envs(options.plugin_env())
        .env(CHANNEL_FD_ENV, CHILD_CHANNEL_FD.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }

    let raw = child_end.raw_fd();
    // SAFETY: the hook only calls async-signal-safe functions.
    unsafe {
        command.pre_exec(move || ChildChannel::install_as_child_fd(raw));
    }

    let child = command.spawn().map_err(|source| WorkerError::Spawn {
        program: options.program.clone(),
        source,
    })?;
    // The child holds its own copy now.
    drop(child_end);
    Ok((child, parent))
}

async fn route_inbound(
    inner: Arc<WorkerInner>,
    mut receiver: LinkReceiver,
    rpc_tx: mpsc::UnboundedSender<Inbound>,
    control_tx: mpsc::UnboundedSender<Bytes>,
) {
    while let Some(inbound) = receiver.recv().await {
        inner.mark_connected();
        match inbound.channel {
            RPC => {
                let _ = rpc_tx.send(inbound);
            }
            CONTROL => {
                let _ = control_tx.send(inbound.payload);
            }
            other => warn!(
                pid = inner.pid,
                channel = channel_name(other),
                "frame on unknown channel dropped"
            ),
        }
    }
    debug!(pid = inner.pid, "worker channel closed");
}

async fn supervise(inner: Arc<WorkerInner>, mut child: Child, grace: Duration) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = inner.kill.notified() => {
            if let Err(err) = child.start_kill() {
                debug!(pid = inner.pid, error = %err, "kill signal not delivered");
            }
            child.wait().await
        }
    };

    let (reason, code, signal) = match status {
        Ok(status) => {
            let code = status.code();
            let signal = status.signal();
            let reason = if inner.kill_requested.load(Ordering::Acquire) {
                TerminationReason::Killed
            } else if let Some(signal) = signal {
                TerminationReason::Signaled(signal)
            } else {
                TerminationReason::NormalExit(code.unwrap_or(-1))
            };
            (reason, code, signal)
        }
        Err(err) => {
            inner.events.emit(WorkerEvent::Error(err.to_string()));
            (TerminationReason::Crashed(err.to_string()), None, None)
        }
    };

    info!(pid = inner.pid, reason = %reason, "worker terminated");
    inner.terminate(reason.clone());
    inner.events.emit(WorkerEvent::Exit { code, signal });

    if let Some(link) = &inner.link {
        if tokio::time::timeout(grace, link.closed()).await.is_err() {
            debug!(pid = inner.pid, "channel still open after exit, closing it");
        }
        link.close();
        link.closed().await;
    }

    let peer = inner.peer.lock().clone();
    if let Some(peer) = peer {
        peer.close(&format!("plugin {reason}"));
    }
    inner.closed.cancel();
    inner.events.finish(WorkerEvent::Close { code, signal });
}

/// Writes a peer's messages through the worker, subject to its state.
struct WorkerSink {
    inner: Weak<WorkerInner>,
    handles: bool,
    max_payload: usize,
}

impl MessageSink for WorkerSink {
    fn send_frame(&self, payload: Bytes, handle: Option<OwnedFd>) -> plugrpc_peer::Result<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| RpcError::PeerDisconnected("worker dropped".to_string()))?;
        inner
            .send_payload(payload, handle)
            .map_err(WorkerError::into_rpc)
    }

    fn supports_handles(&self) -> bool {
        self.handles
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugrpc_peer::ErrorKind;

    fn sh(script: &str) -> WorkerOptions {
        WorkerOptions::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn spawn_failure_is_crashed_and_closed() {
        let worker = RuntimeWorker::spawn(WorkerOptions::new("/definitely/not/a/plugin"));
        assert_eq!(worker.pid(), None);
        assert!(matches!(
            worker.state(),
            WorkerState::Terminated {
                reason: TerminationReason::Crashed(_)
            }
        ));

        let mut events = worker.subscribe();
        assert!(matches!(events.recv().await, Some(WorkerEvent::Error(_))));
        assert!(matches!(events.recv().await, Some(WorkerEvent::Close { .. })));
        assert_eq!(events.recv().await, None);
        assert!(worker.is_closed());
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let worker = RuntimeWorker::spawn(sh("exit 7"));
        assert!(worker.pid().is_some());
        let mut events = worker.subscribe();

        assert_eq!(worker.wait_closed().await, TerminationReason::NormalExit(7));
        assert_eq!(
            events.recv().await,
            Some(WorkerEvent::Exit {
                code: Some(7),
                signal: None
            })
        );
        assert_eq!(
            events.recv().await,
            Some(WorkerEvent::Close {
                code: Some(7),
                signal: None
            })
        );
    }

    #[tokio::test]
    async fn kill_is_idempotent_and_reported_as_killed() {
        let worker = RuntimeWorker::spawn(sh("sleep 30"));
        worker.kill();
        worker.kill();
        assert_eq!(worker.wait_closed().await, TerminationReason::Killed);
        worker.kill();
        assert_eq!(worker.state().termination(), Some(&TerminationReason::Killed));
    }

    #[tokio::test]
    async fn signal_is_reported() {
        let worker = RuntimeWorker::spawn(sh("kill -TERM $$"));
        assert_eq!(
            worker.wait_closed().await,
            TerminationReason::Signaled(15)
        );
    }

    #[tokio::test]
    async fn send_is_rejected_before_connect() {
        let worker = RuntimeWorker::spawn(sh("sleep 30"));
        let message = Message::Finalize {
            target_id: 1,
            generation: 0,
        };
        let err = worker.send(&message, None).unwrap_err();
        assert!(matches!(err, WorkerError::Unavailable { state: "spawning" }));

        let mut rejected = None;
        worker.send_or_reject(
            &message,
            None,
            |err| rejected = Some(err),
            Some(&SendContext(serde_json::json!({"route": "test"}))),
        );
        assert!(matches!(rejected, Some(WorkerError::Unavailable { .. })));
        worker.kill();
        worker.wait_closed().await;
    }

    #[tokio::test]
    async fn send_is_rejected_after_exit() {
        let worker = RuntimeWorker::spawn(sh("exit 0"));
        worker.wait_closed().await;
        let err = worker
            .send(
                &Message::Finalize {
                    target_id: 1,
                    generation: 0,
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, WorkerError::Unavailable { state: "terminated" }));
        assert_eq!(err.into_rpc().kind(), ErrorKind::PeerDisconnected);
    }

    #[tokio::test]
    async fn child_sees_channel_and_payload_env() {
        let options = sh("echo \"$PLUGRPC_CHANNEL_FD:$PLUGRPC_PLUGIN_HASH:$EXTRA\"")
            .env("EXTRA", "yes")
            .payload(crate::options::PluginPayload {
                hash: "h1".to_string(),
                unpacked_path: "/tmp".into(),
                archive: None,
            });
        let worker = RuntimeWorker::spawn(options);
        let mut stdout = worker.take_stdout().unwrap();
        assert!(worker.take_stdout().is_none());

        let mut output = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut stdout, &mut output)
            .await
            .unwrap();
        assert_eq!(output.trim(), "3:h1:yes");
        assert!(worker.wait_closed().await.is_clean());
    }

    #[tokio::test]
    async fn raw_rpc_stream_is_taken_once() {
        let worker = RuntimeWorker::spawn(sh("exit 0"));
        let _events = worker.take_rpc_events().unwrap();
        assert!(matches!(
            worker.take_rpc_events(),
            Err(WorkerError::AlreadyTaken(_))
        ));
        assert!(worker.create_peer("host").is_err());
        worker.wait_closed().await;
    }

    #[tokio::test]
    async fn peer_is_closed_when_worker_exits() {
        let worker = RuntimeWorker::spawn(sh("exit 3"));
        let peer = worker.create_peer("host").unwrap();
        assert_eq!(worker.wait_closed().await, TerminationReason::NormalExit(3));

        let err = peer.invoke(1, "anything", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerDisconnected);
    }
}
