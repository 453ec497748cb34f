use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, RpcError};
use crate::object::{Call, RpcObject};
use crate::peer::{PeerShared, RpcPeer};
use crate::value::Value;

/// A local stand-in for an object exported by the other side.
///
/// Clones share one registration. When the last clone is dropped, or on
/// [`dispose`](Proxy::dispose), the owner is told it may release the
/// object.
#[derive(Clone)]
pub struct Proxy {
    pub(crate) inner: Arc<ProxyInner>,
}

pub(crate) struct ProxyInner {
    pub(crate) id: u64,
    pub(crate) generation: AtomicU64,
    pub(crate) disposed: AtomicBool,
    pub(crate) peer: Weak<PeerShared>,
}

impl Proxy {
    /// Id of the target in its owner's stub registry.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Latest export generation seen for the target.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Whether both proxies stand for the same registration.
    pub fn same_target(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The peer this proxy belongs to, while it is alive.
    pub fn peer(&self) -> Option<RpcPeer> {
        self.inner.peer.upgrade().map(RpcPeer::from_shared)
    }

    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_remote(method, args, None).await
    }

    /// Invoke with one OS handle sent alongside the message.
    pub async fn invoke_with_handle(
        &self,
        method: &str,
        args: Vec<Value>,
        handle: OwnedFd,
    ) -> Result<Value> {
        self.call_remote(method, args, Some(handle)).await
    }

    /// Invoke, giving up after `timeout`. The remote call keeps running.
    pub async fn invoke_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        tokio::time::timeout(timeout, self.invoke(method, args))
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
    }

    /// Release the remote object now instead of waiting for the last drop.
    ///
    /// Idempotent. Invoking a disposed proxy fails with `StaleProxy`.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.release();
    }

    async fn call_remote(
        &self,
        method: &str,
        args: Vec<Value>,
        handle: Option<OwnedFd>,
    ) -> Result<Value> {
        if self.is_disposed() {
            return Err(RpcError::StaleProxy {
                target_id: self.id(),
            });
        }
        let peer = self
            .peer()
            .ok_or_else(|| RpcError::PeerDisconnected("peer dropped".to_string()))?;
        peer.call_remote(self.id(), method.to_string(), args, handle)
            .await
    }
}

impl ProxyInner {
    fn release(&self) {
        if let Some(peer) = self.peer.upgrade() {
            peer.release_proxy_slot(
                self.id,
                self as *const ProxyInner,
                self.generation.load(Ordering::Acquire),
            );
        }
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if !*self.disposed.get_mut() {
            self.release();
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id())
            .field("generation", &self.generation())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[async_trait]
impl RpcObject for Proxy {
    async fn call(&self, call: Call) -> Result<Value> {
        self.call_remote(&call.method, call.args, call.handle).await
    }

    fn as_proxy(&self) -> Option<&Proxy> {
        Some(self)
    }
}
