use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plugrpc_peer::{
    host_handshake, HandshakeConfig, HelloInfo, Proxy, RpcError, RpcObject, RpcPeer, Value,
};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::event::TerminationReason;
use crate::options::WorkerOptions;
use crate::worker::RuntimeWorker;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

const EXIT_REPORT_WAIT: Duration = Duration::from_millis(500);

/// How to start a plugin session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label used in logs and as the host peer's name.
    pub name: String,
    pub worker: WorkerOptions,
    pub handshake: HandshakeConfig,
    /// Forward the child's stdout/stderr to `tracing` (target `plugin`).
    pub forward_output: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "plugin".to_string(),
            worker: WorkerOptions::default(),
            handshake: HandshakeConfig::default(),
            forward_output: true,
        }
    }
}

impl SessionConfig {
    pub fn new(worker: WorkerOptions) -> Self {
        Self {
            worker,
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake.timeout = timeout;
        self
    }
}

/// Session lifecycle: `Starting -> Ready -> Terminated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Terminated { reason: TerminationReason },
}

/// One plugin process paired with the host peer talking to it.
///
/// There is no restart: once terminated, the host may start a new session.
/// Dropping the session kills the process.
pub struct PluginSession {
    name: String,
    session_id: String,
    worker: RuntimeWorker,
    peer: RpcPeer,
    root: Option<Proxy>,
    hello: HelloInfo,
    state: watch::Receiver<SessionState>,
}

impl PluginSession {
    /// Spawn the plugin and wait until it completed the handshake.
    ///
    /// Any failure before readiness kills the process and returns
    /// [`RpcError::Spawn`].
    pub async fn start(config: SessionConfig) -> Result<Self, RpcError> {
        Self::start_with_host(config, None).await
    }

    /// Like [`start`](PluginSession::start), handing `host_api` to the plugin.
    pub async fn start_with_host(
        config: SessionConfig,
        host_api: Option<Arc<dyn RpcObject>>,
    ) -> Result<Self, RpcError> {
        let session_id = format!(
            "s{}-{}",
            std::process::id(),
            NEXT_SESSION.fetch_add(1, Ordering::Relaxed)
        );
        let (state_tx, state) = watch::channel(SessionState::Starting);

        let worker = RuntimeWorker::spawn(config.worker.clone());
        if let Some(reason) = worker.state().termination() {
            return Err(RpcError::Spawn(reason.to_string()));
        }
        if config.forward_output {
            forward_output(&worker, &config.name);
        }

        let (peer, hello, root) = match connect(&worker, &config, &session_id, host_api).await {
            Ok(connected) => connected,
            Err(err) => {
                warn!(session = %config.name, error = %err, "plugin session failed to start");
                worker.kill();
                return Err(match err {
                    RpcError::Spawn(_) => err,
                    other => RpcError::Spawn(other.to_string()),
                });
            }
        };

        info!(
            session = %config.name,
            session_id = %session_id,
            pid = hello.pid,
            version = %hello.protocol_version,
            "plugin session ready"
        );
        state_tx.send_replace(SessionState::Ready);
        tokio::spawn(monitor(
            worker.clone(),
            peer.clone(),
            state_tx,
            config.name.clone(),
        ));

        Ok(Self {
            name: config.name,
            session_id,
            worker,
            peer,
            root,
            hello,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Pid the plugin reported in its hello.
    pub fn pid(&self) -> u32 {
        self.hello.pid
    }

    /// Protocol version the plugin speaks.
    pub fn protocol_version(&self) -> &str {
        &self.hello.protocol_version
    }

    pub fn worker(&self) -> &RuntimeWorker {
        &self.worker
    }

    pub fn peer(&self) -> &RpcPeer {
        &self.peer
    }

    /// The plugin's root object, if it exported one.
    pub fn root(&self) -> Option<&Proxy> {
        self.root.as_ref()
    }

    /// Invoke `method` on the plugin's root object.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        let root = self.root.as_ref().ok_or_else(|| {
            RpcError::ProtocolViolation("plugin exported no root object".to_string())
        })?;
        root.invoke(method, args).await
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session terminated; the peer is torn down by then.
    pub async fn wait_terminated(&self) -> TerminationReason {
        let mut state = self.state.clone();
        loop {
            if let SessionState::Terminated { reason } = &*state.borrow_and_update() {
                return reason.clone();
            }
            if state.changed().await.is_err() {
                return TerminationReason::Crashed("session monitor stopped".to_string());
            }
        }
    }

    pub fn kill(&self) {
        self.worker.kill();
    }

    /// Ask the plugin to exit, killing it after `grace`.
    pub async fn shutdown(&self, grace: Duration) -> TerminationReason {
        self.worker.shutdown(grace).await;
        self.wait_terminated().await
    }
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        self.worker.kill();
    }
}

impl std::fmt::Debug for PluginSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSession")
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("pid", &self.hello.pid)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

async fn connect(
    worker: &RuntimeWorker,
    config: &SessionConfig,
    session_id: &str,
    host_api: Option<Arc<dyn RpcObject>>,
) -> Result<(RpcPeer, HelloInfo, Option<Proxy>), RpcError> {
    let peer = worker
        .create_peer(config.name.clone())
        .map_err(WorkerError::into_rpc)?;
    let host_root = host_api.map(|api| peer.export(api)).transpose()?;
    let mut control = worker.take_control().map_err(WorkerError::into_rpc)?;

    let handshake = tokio::select! {
        hello = host_handshake(&mut control, &config.handshake, session_id, host_root) => hello,
        reason = worker.wait_terminated() => {
            return Err(RpcError::Spawn(format!("plugin {reason} before handshake")));
        }
    };
    let hello = match handshake {
        Ok(hello) => hello,
        // The channel usually closes just before the exit is observed.
        Err(RpcError::PeerDisconnected(detail)) => {
            return Err(
                match tokio::time::timeout(EXIT_REPORT_WAIT, worker.wait_terminated()).await {
                    Ok(reason) => RpcError::Spawn(format!("plugin {reason} before handshake")),
                    Err(_) => RpcError::PeerDisconnected(detail),
                },
            );
        }
        Err(err) => return Err(err),
    };

    let root = match &hello.root {
        Some(root) => peer.import(root)?.as_proxy().cloned(),
        None => None,
    };
    Ok((peer, hello, root))
}

async fn monitor(
    worker: RuntimeWorker,
    peer: RpcPeer,
    state: watch::Sender<SessionState>,
    name: String,
) {
    let reason = worker.wait_closed().await;
    peer.close(&format!("plugin {reason}"));
    info!(session = %name, reason = %reason, "plugin session terminated");
    state.send_replace(SessionState::Terminated { reason });
}

fn forward_output(worker: &RuntimeWorker, session: &str) {
    if let Some(stdout) = worker.take_stdout() {
        tokio::spawn(forward_lines(stdout, session.to_string(), false));
    }
    if let Some(stderr) = worker.take_stderr() {
        tokio::spawn(forward_lines(stderr, session.to_string(), true));
    }
}

async fn forward_lines<R>(reader: R, session: String, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!(target: "plugin", session = %session, "{line}"),
            Ok(Some(line)) => info!(target: "plugin", session = %session, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(session = %session, error = %err, "plugin output stream failed");
                break;
            }
        }
    }
}
