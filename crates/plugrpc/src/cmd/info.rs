use std::time::Duration;

use plugrpc_worker::{PluginSession, SessionConfig};
use serde::Serialize;

use crate::cmd::{runtime, InfoArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct InfoOutput {
    session: String,
    session_id: String,
    pid: u32,
    protocol_version: String,
    root_exported: bool,
    handles_supported: bool,
    shutdown: String,
}

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let grace = args.plugin.shutdown_grace()?;
    let config = args.plugin.session_config()?;

    let out = runtime()?.block_on(inspect(config, grace))?;
    print_info(&out, format);
    Ok(SUCCESS)
}

async fn inspect(config: SessionConfig, grace: Duration) -> CliResult<InfoOutput> {
    let session = PluginSession::start(config)
        .await
        .map_err(|err| rpc_error("plugin failed to start", err))?;

    let mut out = InfoOutput {
        session: session.name().to_string(),
        session_id: session.session_id().to_string(),
        pid: session.pid(),
        protocol_version: session.protocol_version().to_string(),
        root_exported: session.root().is_some(),
        handles_supported: session.worker().supports_handles(),
        shutdown: String::new(),
    };
    out.shutdown = session.shutdown(grace).await.to_string();
    Ok(out)
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Plugin Info:");
            println!("  Session:          {} ({})", out.session, out.session_id);
            println!("  Pid:              {}", out.pid);
            println!("  Protocol:         plugrpc {}", out.protocol_version);
            println!("  Root object:      {}", yes_no(out.root_exported));
            println!("  Handle passing:   {}", yes_no(out.handles_supported));
            println!("  Shutdown:         {}", out.shutdown);
        }
        OutputFormat::Raw => {
            println!("{}", out.pid);
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
