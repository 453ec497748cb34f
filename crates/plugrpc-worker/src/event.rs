use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    /// The process exited on its own with this code.
    NormalExit(i32),
    /// The process was ended by this signal.
    Signaled(i32),
    /// The process never started, or could not be waited on.
    Crashed(String),
    /// [`kill`](crate::RuntimeWorker::kill) was requested.
    Killed,
}

impl TerminationReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::NormalExit(0))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NormalExit(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "terminated by signal {signal}"),
            Self::Crashed(error) => write!(f, "crashed: {error}"),
            Self::Killed => f.write_str("killed"),
        }
    }
}

/// Worker lifecycle: `Spawning -> Connected -> Terminated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    /// The child has spoken on its channel.
    Connected,
    Terminated { reason: TerminationReason },
}

impl WorkerState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Connected => "connected",
            Self::Terminated { .. } => "terminated",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    pub fn termination(&self) -> Option<&TerminationReason> {
        match self {
            Self::Terminated { reason } => Some(reason),
            _ => None,
        }
    }
}

/// A process lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Spawn or I/O failure.
    Error(String),
    /// The process terminated.
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process terminated and its channel is closed. Always the last event.
    Close {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Fan-out of worker events to any number of subscribers.
///
/// Events are delivered to subscribers in subscription order. Until the
/// first subscription, events are kept so that subscriber sees everything
/// since spawn.
pub(crate) struct EventHub {
    inner: Mutex<HubInner>,
}

struct HubInner {
    backlog: Option<Vec<WorkerEvent>>,
    subscribers: Vec<mpsc::UnboundedSender<WorkerEvent>>,
    finished: bool,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                backlog: Some(Vec::new()),
                subscribers: Vec::new(),
                finished: false,
            }),
        }
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if let Some(backlog) = inner.backlog.take() {
            for event in backlog {
                let _ = tx.send(event);
            }
        }
        if !inner.finished {
            inner.subscribers.push(tx);
        }
        rx
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        let mut inner = self.inner.lock();
        if inner.finished {
            return;
        }
        if let Some(backlog) = &mut inner.backlog {
            backlog.push(event.clone());
        }
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Emit the final event and end every subscription.
    pub(crate) fn finish(&self, event: WorkerEvent) {
        self.emit(event);
        let mut inner = self.inner.lock();
        inner.finished = true;
        inner.subscribers.clear();
    }
}
