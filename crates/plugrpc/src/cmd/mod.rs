use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use plugrpc_worker::{SessionConfig, WorkerOptions};

use crate::exit::{io_error, worker_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod demo_plugin;
pub mod info;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a plugin, invoke one method on its root object and print the result.
    Call(CallArgs),
    /// Start a plugin and print what it reported in its handshake.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run as a demo plugin child (used by tests).
    #[command(hide = true)]
    DemoPlugin,
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Call(args) => call::run(args, format),
        Command::Info(args) => info::run(args, format),
        Command::Version(args) => version::run(args),
        Command::DemoPlugin => demo_plugin::run(),
    }
}

/// Where the plugin comes from and how long to wait for it.
#[derive(Args, Debug)]
pub struct PluginArgs {
    /// Plugin executable. Overrides `program` from --config.
    pub program: Option<PathBuf>,
    /// Arguments passed to the plugin (after `--`).
    #[arg(last = true)]
    pub plugin_args: Vec<String>,
    /// JSON file with worker options (program, args, env, cwd, payload, debug).
    #[arg(long, value_name = "FILE", env = "PLUGRPC_CONFIG")]
    pub config: Option<PathBuf>,
    /// How long the plugin may take to complete its handshake.
    #[arg(long, default_value = "10s", env = "PLUGRPC_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: String,
    /// How long to wait for a graceful exit before killing the plugin.
    #[arg(long, default_value = "2s")]
    pub shutdown_grace: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    #[command(flatten)]
    pub plugin: PluginArgs,
    /// Method to invoke on the plugin's root object.
    #[arg(long, short = 'm')]
    pub method: String,
    /// Arguments as a JSON array.
    #[arg(long, default_value = "[]")]
    pub args: String,
    /// Maximum time to wait for the reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub plugin: PluginArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

impl PluginArgs {
    pub fn session_config(&self) -> CliResult<SessionConfig> {
        let mut options = match &self.config {
            Some(path) => WorkerOptions::from_json_file(path)
                .map_err(|err| worker_error("failed to load worker config", err))?,
            None => WorkerOptions::default(),
        };
        if let Some(program) = &self.program {
            options.program = program.clone();
        }
        if options.program.as_os_str().is_empty() {
            return Err(CliError::new(
                USAGE,
                "no plugin program given (pass PROGRAM or --config)",
            ));
        }
        options.args.extend(self.plugin_args.iter().cloned());

        let name = options
            .program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string());
        Ok(SessionConfig::new(options)
            .name(name)
            .handshake_timeout(parse_timeout(&self.handshake_timeout)?))
    }

    pub fn shutdown_grace(&self) -> CliResult<Duration> {
        parse_timeout(&self.shutdown_grace)
    }
}

pub fn runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start async runtime", err))
}

pub fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
