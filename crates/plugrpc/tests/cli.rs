#![cfg(all(unix, feature = "cli"))]

use std::process::{Command, Output};

const BIN: &str = env!("CARGO_BIN_EXE_plugrpc");

/// Run `plugrpc` with `args`, using the binary itself as the demo plugin.
fn plugrpc(args: &[&str]) -> Output {
    Command::new(BIN)
        .args(["--log-level", "error", "--format", "json"])
        .args(args)
        .output()
        .expect("plugrpc should run")
}

fn demo_call(method: &str, call_args: &str) -> Output {
    plugrpc(&[
        "call",
        BIN,
        "--method",
        method,
        "--args",
        call_args,
        "--",
        "--log-level",
        "error",
        "demo-plugin",
    ])
}

#[test]
fn call_prints_the_result_as_json() {
    let output = demo_call("add", "[2, 3]");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let json: serde_json::Value = serde_json::from_str(stdout.trim()).expect("json output");
    assert_eq!(json["method"], "add");
    assert_eq!(json["result"], 5);
}

#[test]
fn remote_failure_returns_remote_error_code() {
    let output = demo_call("fail", r#"["out of film"]"#);
    assert_eq!(output.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("out of film"), "stderr: {stderr}");
}

#[test]
fn missing_plugin_returns_spawn_code() {
    let output = plugrpc(&["call", "/nonexistent/plugin", "--method", "add"]);
    assert_eq!(output.status.code(), Some(20));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("plugin failed to start"), "stderr: {stderr}");
}

#[test]
fn call_timeout_returns_124() {
    let output = plugrpc(&[
        "call",
        BIN,
        "--method",
        "sleep",
        "--args",
        "[10000]",
        "--timeout",
        "200ms",
        "--",
        "demo-plugin",
    ]);
    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn bad_args_json_is_rejected_before_spawning() {
    let output = plugrpc(&["call", "/nonexistent/plugin", "--method", "add", "--args", "{}"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn info_reports_the_handshake() {
    let output = plugrpc(&["info", BIN, "--", "--log-level", "error", "demo-plugin"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let json: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("info should print json");
    assert_eq!(json["protocol_version"], "1.0");
    assert_eq!(json["root_exported"], true);
    assert_eq!(json["handles_supported"], true);
    assert_eq!(json["shutdown"], "exited with code 0");
    assert!(json["pid"].as_u64().unwrap() > 0);
}

#[test]
fn version_prints_package_version() {
    let output = plugrpc(&["version"]);
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("plugrpc {}", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn extended_version_names_the_protocol() {
    let output = plugrpc(&["version", "--extended"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("protocol: plugrpc 1.0"), "stdout: {stdout}");
}
