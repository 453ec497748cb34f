use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{Result, RpcError};
use crate::proxy::Proxy;
use crate::value::Value;

/// Something that can be called across the connection.
///
/// One entry point serves every method: the object decides what the
/// method name means. Exported objects live in the owner's stub registry
/// and are reached by remote [`Proxy`] handles.
#[async_trait]
pub trait RpcObject: Send + Sync + 'static {
    async fn call(&self, call: Call) -> Result<Value>;

    /// Returns `Some` only for proxies.
    fn as_proxy(&self) -> Option<&Proxy> {
        None
    }
}

/// One method invocation as seen by the called object.
pub struct Call {
    pub method: String,
    pub args: Vec<Value>,
    /// OS handle that travelled alongside the invocation.
    pub handle: Option<OwnedFd>,
}

impl Call {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            handle: None,
        }
    }

    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args.get(index).ok_or_else(|| {
            RpcError::throw(format!(
                "{}: missing argument {} (got {})",
                self.method,
                index,
                self.args.len()
            ))
        })
    }

    pub fn arg_i64(&self, index: usize) -> Result<i64> {
        self.arg(index)?.as_i64().ok_or_else(|| {
            RpcError::throw(format!("{}: argument {} is not an integer", self.method, index))
        })
    }

    pub fn arg_f64(&self, index: usize) -> Result<f64> {
        self.arg(index)?.as_f64().ok_or_else(|| {
            RpcError::throw(format!("{}: argument {} is not a number", self.method, index))
        })
    }

    pub fn arg_str(&self, index: usize) -> Result<&str> {
        self.arg(index)?.as_str().ok_or_else(|| {
            RpcError::throw(format!("{}: argument {} is not a string", self.method, index))
        })
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method)
            .field("args", &self.args)
            .field("handle", &self.handle.is_some())
            .finish()
    }
}

type Handler = Box<dyn Fn(Call) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// An object assembled from a fixed set of named async methods.
///
/// ```ignore
/// let calc = MethodTable::new("calculator")
///     .method("add", |call| async move { Ok(Value::Int(call.arg_i64(0)? + call.arg_i64(1)?)) })
///     .into_object();
/// ```
pub struct MethodTable {
    name: String,
    methods: HashMap<String, Handler>,
}

impl MethodTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Register `name`. A later registration of the same name replaces it.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.methods
            .insert(name.into(), Box::new(move |call| handler(call).boxed()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn into_object(self) -> Arc<dyn RpcObject> {
        Arc::new(self)
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}

#[async_trait]
impl RpcObject for MethodTable {
    async fn call(&self, call: Call) -> Result<Value> {
        match self.methods.get(&call.method) {
            Some(handler) => handler(call).await,
            None => Err(RpcError::throw(format!(
                "{}: unknown method '{}'",
                self.name, call.method
            ))),
        }
    }
}
