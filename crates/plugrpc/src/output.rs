use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use plugrpc_peer::Value;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct CallOutput<'a> {
    method: &'a str,
    session_id: &'a str,
    elapsed_ms: f64,
    result: serde_json::Value,
}

pub fn print_result(
    method: &str,
    session_id: &str,
    elapsed_ms: f64,
    value: &Value,
    format: OutputFormat,
) {
    let result = value.to_json();
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                method,
                session_id,
                elapsed_ms,
                result,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "SESSION", "ELAPSED", "RESULT"])
                .add_row(vec![
                    method.to_string(),
                    session_id.to_string(),
                    format!("{elapsed_ms:.2}ms"),
                    result.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let body = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
            println!("{method} ({elapsed_ms:.2}ms):");
            println!("{body}");
        }
        OutputFormat::Raw => match value {
            Value::Bytes(bytes) => print_raw(bytes),
            Value::String(text) => print_raw(text.as_bytes()),
            other => println!("{}", other.to_json()),
        },
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_output_serializes_result_as_plain_json() {
        let out = CallOutput {
            method: "add",
            session_id: "s1-1",
            elapsed_ms: 1.5,
            result: Value::Int(5).to_json(),
        };
        let json = serde_json::to_string(&out).unwrap();
        assert_eq!(
            json,
            r#"{"method":"add","session_id":"s1-1","elapsed_ms":1.5,"result":5}"#
        );
    }
}
