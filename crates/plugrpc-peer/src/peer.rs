//! The protocol engine bound to one end of a link.
//!
//! All registries live behind one lock per peer. Nothing that may run
//! user code or drop a [`Proxy`] happens while it is held: removed stubs
//! and settled values are handed back and dropped after unlocking.

use std::collections::HashMap;
use std::fmt;
use std::os::fd::OwnedFd;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use plugrpc_frame::{FrameError, LinkSender, RPC};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::{ErrorKind, Result, RpcError};
use crate::message::Message;
use crate::object::{Call, RpcObject};
use crate::proxy::{Proxy, ProxyInner};
use crate::value::{ObjectRef, Owner, Value, WireValue, MAX_DEPTH};

/// Where a peer writes its encoded messages.
pub trait MessageSink: Send + Sync + 'static {
    /// Queue one encoded RPC message, optionally with an OS handle.
    fn send_frame(&self, payload: Bytes, handle: Option<OwnedFd>) -> Result<()>;

    fn supports_handles(&self) -> bool;

    /// Largest payload the sink accepts.
    fn max_payload(&self) -> usize;
}

impl MessageSink for LinkSender {
    fn send_frame(&self, payload: Bytes, handle: Option<OwnedFd>) -> Result<()> {
        self.send(RPC, payload, handle).map_err(link_error)
    }

    fn supports_handles(&self) -> bool {
        LinkSender::supports_handles(self)
    }

    fn max_payload(&self) -> usize {
        LinkSender::max_payload(self)
    }
}

/// Map a link send failure onto the peer taxonomy.
pub fn link_error(err: FrameError) -> RpcError {
    match err {
        FrameError::ConnectionClosed => RpcError::PeerDisconnected("link closed".to_string()),
        FrameError::HandleUnsupported => {
            RpcError::ProtocolViolation("link cannot carry OS handles".to_string())
        }
        FrameError::PayloadTooLarge { size, max } => {
            RpcError::Serialization(format!("message too large ({size} bytes, max {max})"))
        }
        other => RpcError::Frame(other),
    }
}

struct Stub {
    object: Arc<dyn RpcObject>,
    generation: u64,
}

struct Pending {
    tx: oneshot::Sender<Result<Value>>,
    target_id: u64,
}

#[derive(Default)]
struct Registry {
    closed: Option<String>,
    next_export_id: u64,
    next_call_id: u64,
    stubs: HashMap<u64, Stub>,
    /// Object address to stub id, so re-exporting keeps identity.
    exported: HashMap<usize, u64>,
    proxies: HashMap<u64, Weak<ProxyInner>>,
    pending: HashMap<u64, Pending>,
}

/// Stubs touched while serializing one message, undone if it fails.
#[derive(Default)]
struct ExportJournal {
    created: Vec<u64>,
    bumped: Vec<u64>,
}

impl ExportJournal {
    fn rollback(self, reg: &mut Registry) -> Vec<Stub> {
        for id in &self.bumped {
            if let Some(stub) = reg.stubs.get_mut(id) {
                stub.generation -= 1;
            }
        }
        let mut removed = Vec::with_capacity(self.created.len());
        for id in self.created {
            if let Some(stub) = reg.stubs.remove(&id) {
                reg.exported.remove(&object_key(&stub.object));
                removed.push(stub);
            }
        }
        removed
    }
}

fn object_key(object: &Arc<dyn RpcObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

pub(crate) struct PeerShared {
    name: String,
    sink: Arc<dyn MessageSink>,
    registry: Mutex<Registry>,
    violations: AtomicU64,
    closing: AtomicBool,
}

/// One endpoint of the RPC protocol. Cheap to clone.
#[derive(Clone)]
pub struct RpcPeer {
    shared: Arc<PeerShared>,
}

impl RpcPeer {
    pub fn new(name: impl Into<String>, sink: impl MessageSink) -> Self {
        Self::with_sink(name, Arc::new(sink))
    }

    pub fn with_sink(name: impl Into<String>, sink: Arc<dyn MessageSink>) -> Self {
        let name = name.into();
        debug!(peer = %name, "peer created");
        Self {
            shared: Arc::new(PeerShared {
                name,
                sink,
                registry: Mutex::new(Registry {
                    next_export_id: 1,
                    next_call_id: 1,
                    ..Registry::default()
                }),
                violations: AtomicU64::new(0),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<PeerShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Proxy for a remote target known only by id.
    ///
    /// Reuses the live proxy for `target_id` if there is one. A proxy made
    /// here is unversioned: dropping or disposing it releases nothing on the
    /// other side unless a versioned reference to the same id arrives while
    /// it is alive. Use [`release`](RpcPeer::release) to let go of the target
    /// explicitly.
    pub fn get_proxy(&self, target_id: u64) -> Proxy {
        let mut reg = self.shared.registry.lock();
        self.shared.import_proxy(&mut reg, target_id, 0)
    }

    /// Export a local object and return the reference to send for it.
    pub fn export(&self, object: Arc<dyn RpcObject>) -> Result<ObjectRef> {
        let mut reg = self.shared.registry.lock();
        if let Some(reason) = &reg.closed {
            return Err(RpcError::PeerDisconnected(reason.clone()));
        }
        let mut journal = ExportJournal::default();
        Ok(self.shared.export_object(&mut reg, object, &mut journal))
    }

    /// Turn a reference received out of band (e.g. in a handshake) into a value.
    pub fn import(&self, object_ref: &ObjectRef) -> Result<Value> {
        let wire = WireValue::Ref(*object_ref);
        let mut reg = self.shared.registry.lock();
        self.shared.check_wire(&reg, &wire, 0)?;
        Ok(self.shared.from_wire(&mut reg, wire))
    }

    /// Call `method` on the remote object `target_id`.
    pub async fn invoke(&self, target_id: u64, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_remote(target_id, method.to_string(), args, None)
            .await
    }

    /// Like [`invoke`](RpcPeer::invoke), with one OS handle sent alongside.
    pub async fn invoke_with_handle(
        &self,
        target_id: u64,
        method: &str,
        args: Vec<Value>,
        handle: OwnedFd,
    ) -> Result<Value> {
        self.call_remote(target_id, method.to_string(), args, Some(handle))
            .await
    }

    /// Like [`invoke`](RpcPeer::invoke), giving up after `timeout`.
    ///
    /// The remote side is not told; a late reply is dropped as unknown.
    pub async fn invoke_timeout(
        &self,
        target_id: u64,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        tokio::time::timeout(timeout, self.invoke(target_id, method, args))
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
    }

    pub(crate) async fn call_remote(
        &self,
        target_id: u64,
        method: String,
        args: Vec<Value>,
        handle: Option<OwnedFd>,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        let (call_id, payload, rolled_back) = {
            let mut reg = self.shared.registry.lock();
            if let Some(reason) = &reg.closed {
                return Err(RpcError::PeerDisconnected(reason.clone()));
            }
            if handle.is_some() && !self.shared.sink.supports_handles() {
                return Err(RpcError::ProtocolViolation(
                    "link cannot carry OS handles".to_string(),
                ));
            }

            let call_id = reg.next_call_id;
            let mut journal = ExportJournal::default();
            let encoded = args
                .iter()
                .map(|arg| self.shared.to_wire(&mut reg, arg, 0, &mut journal))
                .collect::<Result<Vec<_>>>()
                .and_then(|args| {
                    self.shared.encode(&Message::Invoke {
                        call_id,
                        target_id,
                        method: method.clone(),
                        args,
                    })
                });

            match encoded {
                Ok(payload) => {
                    reg.next_call_id += 1;
                    reg.pending.insert(call_id, Pending { tx, target_id });
                    (call_id, payload, Ok(()))
                }
                Err(err) => (call_id, Bytes::new(), Err((err, journal.rollback(&mut reg)))),
            }
        };
        if let Err((err, removed)) = rolled_back {
            drop(removed);
            return Err(err);
        }

        trace!(peer = %self.shared.name, call_id, target_id, method = %method, "invoke");
        let _pending = PendingGuard {
            shared: &self.shared,
            call_id,
        };
        if let Err(err) = self.shared.sink.send_frame(payload, handle) {
            // If close() already settled the call, its outcome wins.
            let pending = self.shared.registry.lock().pending.remove(&call_id);
            if pending.is_some() {
                return Err(err);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::PeerDisconnected(
                "call dropped without reply".to_string(),
            )),
        }
    }

    /// Decode and handle one inbound RPC payload.
    ///
    /// Undecodable payloads count as protocol violations and are dropped.
    pub fn dispatch_payload(&self, payload: &[u8], handle: Option<OwnedFd>) {
        match Message::from_bytes(payload) {
            Ok(message) => self.dispatch(message, handle),
            Err(err) => self.shared.violation(format_args!("undecodable message: {err}")),
        }
    }

    /// Handle one inbound message.
    pub fn dispatch(&self, message: Message, handle: Option<OwnedFd>) {
        if self.is_closed() {
            debug!(peer = %self.shared.name, kind = message.kind_name(), "message after close dropped");
            return;
        }
        trace!(peer = %self.shared.name, kind = message.kind_name(), "dispatch");
        match message {
            Message::Invoke {
                call_id,
                target_id,
                method,
                args,
            } => self.dispatch_invoke(call_id, target_id, method, args, handle),
            Message::Result { call_id, value } => self.settle(call_id, Ok(value)),
            Message::Error {
                call_id,
                kind,
                message,
            } => self.settle(call_id, Err((kind, message))),
            Message::Finalize {
                target_id,
                generation,
            } => {
                self.finalize(target_id, generation);
            }
        }
    }

    fn dispatch_invoke(
        &self,
        call_id: u64,
        target_id: u64,
        method: String,
        args: Vec<WireValue>,
        handle: Option<OwnedFd>,
    ) {
        let prepared = {
            let mut reg = self.shared.registry.lock();
            let checked = match reg.stubs.get(&target_id).map(|stub| Arc::clone(&stub.object)) {
                None => Err(RpcError::StaleProxy { target_id }),
                Some(object) => args
                    .iter()
                    .try_for_each(|arg| self.shared.check_wire(&reg, arg, 0))
                    .map(|()| object),
            };
            // Imported even when rejected, so the caller's capabilities get finalized.
            let args = args
                .into_iter()
                .map(|arg| self.shared.from_wire(&mut reg, arg))
                .collect::<Vec<_>>();
            match checked {
                Ok(object) => Ok((object, args)),
                Err(err) => Err((err, args)),
            }
        };

        let (object, args) = match prepared {
            Ok(prepared) => prepared,
            Err((err, discarded)) => {
                debug!(peer = %self.shared.name, call_id, target_id, error = %err, "invoke rejected");
                self.shared.send_error(call_id, err.kind(), err.wire_message());
                drop(discarded);
                return;
            }
        };

        let peer = self.clone();
        tokio::spawn(async move {
            let call = Call {
                method: method.clone(),
                args,
                handle,
            };
            let outcome = AssertUnwindSafe(object.call(call)).catch_unwind().await;
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    warn!(peer = %peer.shared.name, call_id, method = %method, panic = %detail, "method panicked");
                    Err(RpcError::throw(format!("method '{method}' panicked: {detail}")))
                }
            };
            peer.shared.reply(call_id, result);
        });
    }

    fn settle(&self, call_id: u64, reply: std::result::Result<WireValue, (ErrorKind, String)>) {
        let (settled, discarded) = {
            let mut reg = self.shared.registry.lock();
            match (reg.pending.remove(&call_id), reply) {
                // Nobody waits for it; imported only so its capabilities get finalized.
                (None, Ok(wire)) => (None, Some(self.shared.from_wire(&mut reg, wire))),
                (None, Err(_)) => (None, None),
                (Some(pending), Ok(wire)) => match self.shared.check_wire(&reg, &wire, 0) {
                    Ok(()) => {
                        let value = self.shared.from_wire(&mut reg, wire);
                        (Some((pending.tx, Ok(value))), None)
                    }
                    Err(err) => {
                        let value = self.shared.from_wire(&mut reg, wire);
                        (Some((pending.tx, Err(err))), Some(value))
                    }
                },
                (Some(pending), Err((kind, message))) => {
                    let err = RpcError::from_reply(kind, message, pending.target_id);
                    (Some((pending.tx, Err(err))), None)
                }
            }
        };
        drop(discarded);

        match settled {
            None => self
                .shared
                .violation(format_args!("reply for unknown call id {call_id}")),
            Some((tx, result)) => {
                trace!(peer = %self.shared.name, call_id, ok = result.is_ok(), "call settled");
                // A caller that stopped waiting drops the value here, unlocked.
                let _ = tx.send(result);
            }
        }
    }

    /// Apply a `Finalize` from the other side. Returns whether a stub was removed.
    ///
    /// Unknown ids and stale generations are ignored.
    pub fn finalize(&self, target_id: u64, generation: u64) -> bool {
        let removed = {
            let mut reg = self.shared.registry.lock();
            let current = reg.stubs.get(&target_id).map(|stub| stub.generation);
            match current {
                Some(current) if generation == 0 || generation == current => {
                    let stub = reg.stubs.remove(&target_id);
                    if let Some(stub) = &stub {
                        reg.exported.remove(&object_key(&stub.object));
                    }
                    stub
                }
                Some(current) => {
                    debug!(peer = %self.shared.name, target_id, generation, current, "stale finalize ignored");
                    None
                }
                None => None,
            }
        };
        let released = removed.is_some();
        if released {
            debug!(peer = %self.shared.name, target_id, "stub released");
        }
        drop(removed);
        released
    }

    /// Stop tracking the proxy for `target_id` and tell the owner to release it.
    pub fn release(&self, target_id: u64) {
        let generation = {
            let mut reg = self.shared.registry.lock();
            if reg.closed.is_some() {
                return;
            }
            reg.proxies
                .remove(&target_id)
                .and_then(|weak| weak.upgrade())
                .map(|inner| (inner.generation.load(Ordering::Acquire), inner))
        };
        // The upgraded proxy (if any) is dropped outside the lock.
        let generation = generation.map(|(generation, _inner)| generation).unwrap_or(0);
        self.shared.send_finalize(target_id, generation);
    }

    /// Tear the peer down: every pending call fails with `PeerDisconnected`
    /// and the registries are cleared. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let (pending, stubs) = {
            let mut reg = self.shared.registry.lock();
            reg.closed = Some(reason.to_string());
            reg.exported.clear();
            reg.proxies.clear();
            (
                std::mem::take(&mut reg.pending),
                std::mem::take(&mut reg.stubs),
            )
        };
        info!(
            peer = %self.shared.name,
            pending = pending.len(),
            stubs = stubs.len(),
            reason,
            "peer closed"
        );
        for (_, call) in pending {
            let _ = call
                .tx
                .send(Err(RpcError::PeerDisconnected(reason.to_string())));
        }
        drop(stubs);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Number of protocol violations seen so far.
    pub fn protocol_violations(&self) -> u64 {
        self.shared.violations.load(Ordering::Relaxed)
    }

    /// Number of objects currently exported to the other side.
    pub fn stub_count(&self) -> usize {
        self.shared.registry.lock().stubs.len()
    }

    /// Number of remote objects with a live local proxy.
    pub fn proxy_count(&self) -> usize {
        self.shared
            .registry
            .lock()
            .proxies
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Number of calls waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.shared.registry.lock().pending.len()
    }

    /// Whether `target_id` is currently exported.
    pub fn is_exported(&self, target_id: u64) -> bool {
        self.shared.registry.lock().stubs.contains_key(&target_id)
    }
}

impl fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcPeer")
            .field("name", &self.shared.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerShared {
    fn violation(&self, detail: fmt::Arguments<'_>) {
        let total = self.violations.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(peer = %self.name, total, "protocol violation: {detail}");
    }

    fn encode(&self, message: &Message) -> Result<Bytes> {
        let bytes = message
            .to_bytes()
            .map_err(|err| RpcError::Serialization(err.to_string()))?;
        let max = self.sink.max_payload();
        if bytes.len() > max {
            return Err(RpcError::Serialization(format!(
                "message too large ({} bytes, max {max})",
                bytes.len()
            )));
        }
        Ok(Bytes::from(bytes))
    }

    fn send(&self, message: &Message) {
        let sent = self
            .encode(message)
            .and_then(|payload| self.sink.send_frame(payload, None));
        if let Err(err) = sent {
            debug!(peer = %self.name, kind = message.kind_name(), error = %err, "send failed");
        }
    }

    fn send_error(&self, call_id: u64, kind: ErrorKind, message: String) {
        self.send(&Message::Error {
            call_id,
            kind,
            message,
        });
    }

    fn send_finalize(&self, target_id: u64, generation: u64) {
        trace!(peer = %self.name, target_id, generation, "finalize");
        self.send(&Message::Finalize {
            target_id,
            generation,
        });
    }

    /// Send the outcome of a local method back to the caller.
    fn reply(self: &Arc<Self>, call_id: u64, result: Result<Value>) {
        let value = match result {
            Ok(value) => value,
            Err(err) => {
                self.send_error(call_id, ErrorKind::RemoteThrow, err.wire_message());
                return;
            }
        };

        let encoded = {
            let mut reg = self.registry.lock();
            if reg.closed.is_some() {
                return;
            }
            let mut journal = ExportJournal::default();
            let encoded = self
                .to_wire(&mut reg, &value, 0, &mut journal)
                .and_then(|wire| self.encode(&Message::Result { call_id, value: wire }));
            encoded.map_err(|err| (err, journal.rollback(&mut reg)))
        };

        match encoded {
            Ok(payload) => {
                if let Err(err) = self.sink.send_frame(payload, None) {
                    debug!(peer = %self.name, call_id, error = %err, "reply not sent");
                }
            }
            Err((err, removed)) => {
                drop(removed);
                warn!(peer = %self.name, call_id, error = %err, "result not serializable");
                self.send_error(call_id, ErrorKind::Serialization, err.to_string());
            }
        }
        drop(value);
    }

    fn export_object(
        &self,
        reg: &mut Registry,
        object: Arc<dyn RpcObject>,
        journal: &mut ExportJournal,
    ) -> ObjectRef {
        let key = object_key(&object);
        if let Some(&id) = reg.exported.get(&key) {
            if let Some(stub) = reg.stubs.get_mut(&id) {
                stub.generation += 1;
                journal.bumped.push(id);
                return ObjectRef {
                    id,
                    generation: stub.generation,
                    owner: Owner::Sender,
                };
            }
        }

        let id = reg.next_export_id;
        reg.next_export_id += 1;
        reg.stubs.insert(
            id,
            Stub {
                object,
                generation: 1,
            },
        );
        reg.exported.insert(key, id);
        journal.created.push(id);
        trace!(peer = %self.name, id, "object exported");
        ObjectRef {
            id,
            generation: 1,
            owner: Owner::Sender,
        }
    }

    fn to_wire(
        self: &Arc<Self>,
        reg: &mut Registry,
        value: &Value,
        depth: usize,
        journal: &mut ExportJournal,
    ) -> Result<WireValue> {
        if depth > MAX_DEPTH {
            return Err(RpcError::Serialization(format!(
                "value nested deeper than {MAX_DEPTH} levels"
            )));
        }
        Ok(match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(n) => WireValue::Int(*n),
            Value::Float(x) if !x.is_finite() => {
                return Err(RpcError::Serialization(format!(
                    "non-finite float {x} cannot be sent"
                )))
            }
            Value::Float(x) => WireValue::Float(*x),
            Value::String(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::List(items) => WireValue::List(
                items
                    .iter()
                    .map(|item| self.to_wire(reg, item, depth + 1, journal))
                    .collect::<Result<_>>()?,
            ),
            Value::Map(map) => WireValue::Map(
                map.iter()
                    .map(|(key, item)| -> Result<(String, WireValue)> {
                        Ok((key.clone(), self.to_wire(reg, item, depth + 1, journal)?))
                    })
                    .collect::<Result<_>>()?,
            ),
            Value::Object(object) => match object.as_proxy() {
                Some(proxy) if std::ptr::eq(proxy.inner.peer.as_ptr(), Arc::as_ptr(self)) => {
                    if proxy.is_disposed() {
                        return Err(RpcError::StaleProxy {
                            target_id: proxy.id(),
                        });
                    }
                    WireValue::Ref(ObjectRef {
                        id: proxy.id(),
                        generation: proxy.generation(),
                        owner: Owner::Receiver,
                    })
                }
                // Local objects and proxies from other peers are exported as-is.
                _ => WireValue::Ref(self.export_object(reg, Arc::clone(object), journal)),
            },
        })
    }

    /// Validate an inbound value before anything is created for it.
    fn check_wire(&self, reg: &Registry, wire: &WireValue, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(RpcError::ProtocolViolation(format!(
                "value nested deeper than {MAX_DEPTH} levels"
            )));
        }
        match wire {
            WireValue::List(items) => items
                .iter()
                .try_for_each(|item| self.check_wire(reg, item, depth + 1)),
            WireValue::Map(map) => map
                .values()
                .try_for_each(|item| self.check_wire(reg, item, depth + 1)),
            WireValue::Ref(ObjectRef {
                id,
                owner: Owner::Receiver,
                ..
            }) if !reg.stubs.contains_key(id) => Err(RpcError::StaleProxy { target_id: *id }),
            _ => Ok(()),
        }
    }

    /// Build a value from a wire value that passed [`check_wire`](Self::check_wire).
    fn from_wire(self: &Arc<Self>, reg: &mut Registry, wire: WireValue) -> Value {
        match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(n) => Value::Int(n),
            WireValue::Float(x) => Value::Float(x),
            WireValue::Str(s) => Value::String(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.from_wire(reg, item))
                    .collect(),
            ),
            WireValue::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(key, item)| (key, self.from_wire(reg, item)))
                    .collect(),
            ),
            WireValue::Ref(object_ref) => match object_ref.owner {
                Owner::Sender => Value::from(self.import_proxy(
                    reg,
                    object_ref.id,
                    object_ref.generation,
                )),
                Owner::Receiver => match reg.stubs.get(&object_ref.id) {
                    Some(stub) => Value::Object(Arc::clone(&stub.object)),
                    None => Value::Null,
                },
            },
        }
    }

    fn import_proxy(self: &Arc<Self>, reg: &mut Registry, id: u64, generation: u64) -> Proxy {
        if let Some(inner) = reg.proxies.get(&id).and_then(Weak::upgrade) {
            inner.generation.fetch_max(generation, Ordering::AcqRel);
            return Proxy { inner };
        }
        let inner = Arc::new(ProxyInner {
            id,
            generation: AtomicU64::new(generation),
            disposed: AtomicBool::new(false),
            peer: Arc::downgrade(self),
        });
        reg.proxies.insert(id, Arc::downgrade(&inner));
        trace!(peer = %self.name, id, generation, "proxy created");
        Proxy { inner }
    }

    /// Called when a proxy registration goes away.
    ///
    /// Only the registration that still owns the slot finalizes; a slot
    /// already taken over by a newer live proxy is left alone. Unversioned
    /// registrations never finalize.
    pub(crate) fn release_proxy_slot(&self, id: u64, inner: *const ProxyInner, generation: u64) {
        let owns_slot = {
            let mut reg = self.registry.lock();
            if reg.closed.is_some() {
                return;
            }
            match reg.proxies.get(&id) {
                Some(weak) if std::ptr::eq(weak.as_ptr(), inner) => {
                    reg.proxies.remove(&id);
                    true
                }
                _ => false,
            }
        };
        if owns_slot && generation != 0 {
            self.send_finalize(id, generation);
        }
    }
}

/// Drops the pending entry of a call whose caller stopped waiting.
struct PendingGuard<'a> {
    shared: &'a PeerShared,
    call_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let abandoned = self.shared.registry.lock().pending.remove(&self.call_id);
        if abandoned.is_some() {
            trace!(peer = %self.shared.name, call_id = self.call_id, "pending call abandoned");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
