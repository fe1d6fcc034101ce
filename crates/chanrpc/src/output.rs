use std::io::{IsTerminal, Write};

use bytes::Bytes;
use chanrpc_protocol::Value;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
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

/// What a call produced, ready for printing.
#[derive(Debug)]
pub enum CallResult {
    Value(Value),
    Streamed(Bytes),
    NotRegistered,
}

impl CallResult {
    fn status(&self) -> &'static str {
        match self {
            CallResult::Value(_) => "ok",
            CallResult::Streamed(_) => "streamed",
            CallResult::NotRegistered => "not_registered",
        }
    }

    fn json(&self) -> serde_json::Value {
        match self {
            CallResult::Value(value) => value.to_json(),
            CallResult::Streamed(data) => serde_json::Value::String(payload_preview(data)),
            CallResult::NotRegistered => serde_json::Value::Null,
        }
    }
}

#[derive(Serialize)]
struct CallOutput<'a> {
    method: &'a str,
    channel: &'a str,
    status: &'static str,
    result: serde_json::Value,
    elapsed_ms: u128,
}

pub fn print_call(
    method: &str,
    channel: &str,
    result: &CallResult,
    elapsed_ms: u128,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let out = CallOutput {
                method,
                channel,
                status: result.status(),
                result: result.json(),
                elapsed_ms,
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
                .set_header(vec!["METHOD", "STATUS", "RESULT", "ELAPSED"])
                .add_row(vec![
                    method.to_string(),
                    result.status().to_string(),
                    result.json().to_string(),
                    format!("{elapsed_ms}ms"),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let pretty = serde_json::to_string_pretty(&result.json())
                .unwrap_or_else(|_| "null".to_string());
            println!("{method} [{}] in {elapsed_ms}ms", result.status());
            println!("{pretty}");
        }
        OutputFormat::Raw => match result {
            CallResult::Streamed(data) => print_raw(data),
            CallResult::Value(Value::Buffer(data)) => print_raw(data),
            CallResult::Value(Value::String(text)) => print_raw(text.as_bytes()),
            other => println!("{}", other.json()),
        },
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_json_follow_the_result() {
        let value = CallResult::Value(Value::Int(3));
        assert_eq!(value.status(), "ok");
        assert_eq!(value.json(), serde_json::json!(3));

        let streamed = CallResult::Streamed(Bytes::from_static(b"tick 1\n"));
        assert_eq!(streamed.json(), serde_json::json!("tick 1\n"));

        let binary = CallResult::Streamed(Bytes::from_static(&[0xff, 0xfe]));
        assert_eq!(binary.json(), serde_json::json!("<binary 2 bytes>"));

        assert_eq!(CallResult::NotRegistered.status(), "not_registered");
    }
}
