use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plugrpc_peer::{MethodTable, RpcError, RpcObject, Value};
use plugrpc_worker::connect_from_env;
use tracing::info;

use crate::cmd::runtime;
use crate::exit::{worker_error, CliResult, SUCCESS};

/// Attach to the host through the inherited channel and serve the demo root.
pub fn run() -> CliResult<i32> {
    runtime()?.block_on(serve())
}

async fn serve() -> CliResult<i32> {
    let connection = connect_from_env(Some(demo_root()))
        .await
        .map_err(|err| worker_error("demo plugin failed to connect", err))?;
    info!(session_id = connection.session_id(), "demo plugin serving");
    connection.serve().await;
    Ok(SUCCESS)
}

pub fn demo_root() -> Arc<dyn RpcObject> {
    MethodTable::new("demo")
        .method("add", |call| async move {
            let a = call.arg_i64(0)?;
            let b = call.arg_i64(1)?;
            a.checked_add(b)
                .map(Value::Int)
                .ok_or_else(|| RpcError::throw("add: overflow"))
        })
        .method("echo", |call| async move { Ok(call.arg(0)?.clone()) })
        .method("concat", |call| async move {
            let mut joined = String::new();
            for (index, arg) in call.args.iter().enumerate() {
                let part = arg.as_str().ok_or_else(|| {
                    RpcError::throw(format!("concat: argument {index} is not a string"))
                })?;
                joined.push_str(part);
            }
            Ok(Value::String(joined))
        })
        .method("counter", |call| async move {
            let start = match call.args.first() {
                Some(value) => value
                    .as_i64()
                    .ok_or_else(|| RpcError::throw("counter: start is not an integer"))?,
                None => 0,
            };
            Ok(Value::Object(counter(start)))
        })
        .method("apply", |call| async move {
            let callback = call
                .arg(0)?
                .as_proxy()
                .cloned()
                .ok_or_else(|| RpcError::throw("apply: argument 0 is not a remote object"))?;
            let method = call.arg_str(1)?.to_string();
            callback.invoke(&method, call.args[2..].to_vec()).await
        })
        .method("sleep", |call| async move {
            let millis = call.arg_i64(0)?;
            let millis = u64::try_from(millis)
                .map_err(|_| RpcError::throw("sleep: duration must not be negative"))?;
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(Value::Int(millis as i64))
        })
        .method("fail", |call| async move {
            let message = call.args.first().and_then(Value::as_str).unwrap_or("failed on request");
            Err(RpcError::throw(message))
        })
        .method("panic", |_call| async move { explode() })
        .method("exit", |call| async move {
            let code = call.args.first().and_then(Value::as_i64).unwrap_or(1);
            info!(code, "exiting on request");
            exit_now(code as i32)
        })
        .method("pid", |_call| async move { Ok(Value::from(std::process::id())) })
        .into_object()
}

fn explode() -> Result<Value, RpcError> {
    panic!("demo plugin panicked on request")
}

/// Ends the process without answering; pending calls see a disconnect.
fn exit_now(code: i32) -> Result<Value, RpcError> {
    std::process::exit(code)
}

/// A capability returned by `counter`: each instance counts on its own.
fn counter(start: i64) -> Arc<dyn RpcObject> {
    let count = Arc::new(AtomicI64::new(start));
    let read = Arc::clone(&count);
    MethodTable::new("counter")
        .method("increment", move |_call| {
            let count = Arc::clone(&count);
            async move { Ok(Value::Int(count.fetch_add(1, Ordering::SeqCst) + 1)) }
        })
        .method("get", move |_call| {
            let read = Arc::clone(&read);
            async move { Ok(Value::Int(read.load(Ordering::SeqCst))) }
        })
        .into_object()
}
