use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use plugrpc_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkerError};

/// Content hash of the plugin payload, exported to the child.
pub const PLUGIN_HASH_ENV: &str = "PLUGRPC_PLUGIN_HASH";
/// Directory the payload was unpacked into.
pub const PLUGIN_PATH_ENV: &str = "PLUGRPC_PLUGIN_PATH";
/// Original payload archive, when known.
pub const PLUGIN_ARCHIVE_ENV: &str = "PLUGRPC_PLUGIN_ARCHIVE";
/// Set to `1` when debugging is enabled.
pub const DEBUG_ENV: &str = "PLUGRPC_DEBUG";
/// Port a debugger may attach to.
pub const INSPECT_PORT_ENV: &str = "PLUGRPC_INSPECT_PORT";

const DEFAULT_EXIT_GRACE_MS: u64 = 100;

/// The unpacked plugin the child should load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginPayload {
    /// Content hash identifying the payload.
    pub hash: String,
    pub unpacked_path: PathBuf,
    pub archive: Option<PathBuf>,
}

/// Debug and inspection toggle, passed through to the child untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub enabled: bool,
    pub inspect_port: Option<u16>,
}

/// How to start a plugin process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment; the parent environment is inherited.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub payload: Option<PluginPayload>,
    pub debug: DebugOptions,
    /// Largest frame payload accepted on the channel.
    pub max_payload_size: usize,
    /// How long to let the channel drain after the process exits.
    pub exit_grace_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            payload: None,
            debug: DebugOptions::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            exit_grace_ms: DEFAULT_EXIT_GRACE_MS,
        }
    }
}

impl WorkerOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn payload(mut self, payload: PluginPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn debug(mut self, debug: DebugOptions) -> Self {
        self.debug = debug;
        self
    }

    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|err| WorkerError::Config(format!("{}: {err}", path.display())))
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
        }
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(WorkerError::Config("program is empty".to_string()));
        }
        if self.max_payload_size == 0 {
            return Err(WorkerError::Config("max_payload_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Variables describing the payload and debug settings, in addition to `env`.
    pub fn plugin_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if let Some(payload) = &self.payload {
            vars.push((PLUGIN_HASH_ENV, payload.hash.clone()));
            vars.push((
                PLUGIN_PATH_ENV,
                payload.unpacked_path.display().to_string(),
            ));
            if let Some(archive) = &payload.archive {
                vars.push((PLUGIN_ARCHIVE_ENV, archive.display().to_string()));
            }
        }
        if self.debug.enabled {
            vars.push((DEBUG_ENV, "1".to_string()));
            if let Some(port) = self.debug.inspect_port {
                vars.push((INSPECT_PORT_ENV, port.to_string()));
            }
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let options: WorkerOptions = serde_json::from_str(
            r#"{"program": "/usr/bin/plugin", "args": ["--fast"], "debug": {"enabled": true}}"#,
        )
        .unwrap();
        assert_eq!(options.program, PathBuf::from("/usr/bin/plugin"));
        assert_eq!(options.args, vec!["--fast"]);
        assert!(options.debug.enabled);
        assert_eq!(options.debug.inspect_port, None);
        assert_eq!(options.max_payload_size, DEFAULT_MAX_PAYLOAD);
        assert_eq!(options.exit_grace(), Duration::from_millis(100));
    }

    #[test]
    fn plugin_env_describes_payload_and_debug() {
        let options = WorkerOptions::new("plugin")
            .payload(PluginPayload {
                hash: "abc123".to_string(),
                unpacked_path: PathBuf::from("/plugins/abc123"),
                archive: None,
            })
            .debug(DebugOptions {
                enabled: true,
                inspect_port: Some(9229),
            });
        let vars = options.plugin_env();
        assert_eq!(
            vars,
            vec![
                (PLUGIN_HASH_ENV, "abc123".to_string()),
                (PLUGIN_PATH_ENV, "/plugins/abc123".to_string()),
                (DEBUG_ENV, "1".to_string()),
                (INSPECT_PORT_ENV, "9229".to_string()),
            ]
        );
    }

    #[test]
    fn debug_port_ignored_when_disabled() {
        let options = WorkerOptions::new("plugin").debug(DebugOptions {
            enabled: false,
            inspect_port: Some(9229),
        });
        assert!(options.plugin_env().is_empty());
    }

    #[test]
    fn empty_program_is_invalid() {
        assert!(matches!(
            WorkerOptions::default().validate(),
            Err(WorkerError::Config(_))
        ));
        assert!(WorkerOptions::new("/bin/true").validate().is_ok());
    }

    #[test]
    fn from_json_file_reports_path_on_error() {
        let path = std::env::temp_dir().join(format!("plugrpc-options-{}.json", std::process::id()));
        std::fs::write(&path, "{ not json").unwrap();
        let err = WorkerOptions::from_json_file(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(err, WorkerError::Config(ref msg) if msg.contains("plugrpc-options")));
    }
}
