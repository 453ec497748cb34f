use std::time::{Duration, Instant};

use plugrpc_peer::Value;
use plugrpc_worker::{PluginSession, SessionConfig};
use tracing::debug;

use crate::cmd::{parse_timeout, runtime, CallArgs};
use crate::exit::{rpc_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, USAGE};
use crate::output::{print_result, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let grace = args.plugin.shutdown_grace()?;
    let call_args = parse_call_args(&args.args)?;
    let config = args.plugin.session_config()?;

    runtime()?.block_on(call(config, &args.method, call_args, timeout, grace, format))
}

async fn call(
    config: SessionConfig,
    method: &str,
    call_args: Vec<Value>,
    timeout: Duration,
    grace: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    let session = PluginSession::start(config)
        .await
        .map_err(|err| rpc_error("plugin failed to start", err))?;
    let root = session
        .root()
        .cloned()
        .ok_or_else(|| CliError::new(FAILURE, "plugin exported no root object"))?;

    let started = Instant::now();
    let outcome = match root.invoke_timeout(method, call_args, timeout).await {
        Ok(value) => {
            let elapsed_ms = (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;
            print_result(method, session.session_id(), elapsed_ms, &value, format);
            Ok(SUCCESS)
        }
        Err(err) => Err(rpc_error(&format!("{method} failed"), err)),
    };
    drop(root);

    let reason = session.shutdown(grace).await;
    debug!(reason = %reason, "plugin stopped");
    outcome
}

fn parse_call_args(input: &str) -> CliResult<Vec<Value>> {
    let json: serde_json::Value = serde_json::from_str(input)
        .map_err(|err| CliError::new(DATA_INVALID, format!("--args is not valid JSON: {err}")))?;
    match json {
        serde_json::Value::Array(items) => Ok(items.into_iter().map(Value::from).collect()),
        _ => Err(CliError::new(USAGE, "--args must be a JSON array")),
    }
}
