//! Line-framed JSON-RPC 2.0 over stdin/stdout.
//!
//! The transport owns stdout: nothing but protocol frames is written there.
//! All diagnostics go to stderr via tracing.

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use ruvltra_engine::PoolHandle;

use crate::mediator::{self, ToolCallError};
use crate::protocol::{ErrorCode, JSONRPC_VERSION, JsonRpcRequest, JsonRpcResponse};
use crate::tools;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Serve requests until stdin closes.
pub(crate) async fn serve(pool: PoolHandle) -> anyhow::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&pool, line).await {
            let raw = serde_json::to_string(&response)?;
            stdout.write_all(raw.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }

    tracing::info!("stdin closed; transport finished");
    Ok(())
}

async fn handle_line(pool: &PoolHandle, line: &str) -> Option<JsonRpcResponse> {
    let request: JsonRpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "unparseable frame");
            return Some(JsonRpcResponse::error(
                Value::Null,
                ErrorCode::ParseError,
                format!("parse error: {err}"),
            ));
        }
    };

    if !request.jsonrpc.is_empty() && request.jsonrpc != JSONRPC_VERSION {
        let id = request.id.clone().unwrap_or(Value::Null);
        return Some(JsonRpcResponse::error(
            id,
            ErrorCode::InvalidRequest,
            format!("unsupported jsonrpc version {:?}", request.jsonrpc),
        ));
    }

    if request.is_notification() {
        tracing::debug!(method = %request.method, "notification");
        return None;
    }

    let id = request.id.clone().unwrap_or(Value::Null);
    Some(dispatch(pool, id, &request.method, &request.params).await)
}

async fn dispatch(pool: &PoolHandle, id: Value, method: &str, params: &Value) -> JsonRpcResponse {
    match method {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "ruvltra",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = tools::catalog().iter().map(|t| t.to_listing()).collect();
            JsonRpcResponse::success(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return JsonRpcResponse::error(
                    id,
                    ErrorCode::InvalidParams,
                    "missing tool name",
                );
            };
            let args = params.get("arguments").cloned().unwrap_or(Value::Null);
            tracing::debug!(tool = name, "tool call");

            match mediator::call_tool(pool, name, &args).await {
                Ok(out) => JsonRpcResponse::success(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": out.text }],
                        "structuredContent": out.structured,
                        "isError": out.is_error,
                    }),
                ),
                Err(err @ ToolCallError::UnknownTool(_)) => {
                    JsonRpcResponse::error(id, ErrorCode::InvalidParams, err.to_string())
                }
                Err(ToolCallError::InvalidParams(msg)) => {
                    JsonRpcResponse::error(id, ErrorCode::InvalidParams, msg)
                }
            }
        }
        other => JsonRpcResponse::error(
            id,
            ErrorCode::MethodNotFound,
            format!("unknown method: {other}"),
        ),
    }
}
