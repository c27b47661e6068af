//! MCP server plumbing: newline-delimited JSON-RPC over stdio.
//!
//! stdout carries protocol frames only; all logging goes to stderr. The
//! dispatch here is deliberately thin - session handling, rate limiting
//! and retries all live in the core modules.

pub mod metrics;
pub mod tools;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use crate::auth::Authenticator;
use crate::error::BridgeError;

use tools::{call_tool, tool_definitions, ToolContext};

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
struct Request {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: String) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// Tool failures are reported as in-band tool results per MCP, so the
/// model sees the error text; protocol failures use JSON-RPC errors.
fn tool_error_result(err: &BridgeError) -> Value {
    json!({
        "content": [{ "type": "text", "text": err.to_string() }],
        "isError": true,
    })
}

fn tool_ok_result(value: &Value) -> Value {
    json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "isError": false,
    })
}

async fn handle_request(ctx: &ToolContext, request: Request) -> Option<Value> {
    let id = request.id.clone()?;

    let result = match request.method.as_str() {
        "initialize" => response(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "taiga-bridge",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => response(id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = tool_definitions()
                .into_iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": t.schema,
                    })
                })
                .collect();
            response(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            debug!(tool = %name, "tool call");
            let started = std::time::Instant::now();
            match call_tool(ctx, &name, &args).await {
                Ok(value) => {
                    ctx.metrics.record(&name, started.elapsed(), true);
                    response(id, tool_ok_result(&value))
                }
                Err(err) => {
                    ctx.metrics.record(&name, started.elapsed(), false);
                    debug!(tool = %name, error = %err, "tool call failed");
                    response(id, tool_error_result(&err))
                }
            }
        }
        other => error_response(id, -32601, format!("method not found: {other}")),
    };
    Some(result)
}

/// Serve MCP over stdio until stdin closes.
pub async fn run_stdio(auth: Arc<Authenticator>) -> anyhow::Result<()> {
    let ctx = ToolContext {
        auth,
        metrics: Arc::new(metrics::MetricsRecorder::new()),
    };
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    info!("MCP server listening on stdio");
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(&ctx, request).await,
            Err(e) => {
                error!(error = %e, "unparseable frame");
                Some(error_response(Value::Null, -32700, format!("parse error: {e}")))
            }
        };
        if let Some(reply) = reply {
            let mut frame = reply.to_string();
            frame.push('\n');
            stdout.write_all(frame.as_bytes()).await?;
            stdout.flush().await?;
        }
    }
    info!("stdin closed, shutting down");
    Ok(())
}
