//! Stdio child-process backend transport.
//!
//! The child is spawned directly (not left to rmcp) so the gateway keeps a
//! `Child` handle for process-group cleanup; the MCP session itself is
//! negotiated over the child's stdio pipes via `rmcp::ServiceExt::serve`.

use anyhow::{Context, Result, anyhow};
use rmcp::ServiceExt;
use rmcp::model::{CallToolRequestParams, RawContent};
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;

use super::guard::StdioGuard;
use crate::config::BackendDefinition;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

fn build_command(def: &BackendDefinition) -> Result<Command> {
    let program = def.command.as_deref().context("missing command")?;
    let mut cmd = Command::new(program);
    cmd.args(&def.args);
    for (key, value) in &def.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    #[cfg(unix)]
    cmd.process_group(0);

    Ok(cmd)
}

/// Spawn the child and negotiate the MCP session, storing the result in `slot`.
/// On any failure after spawn the child is killed before returning `Err`.
pub async fn connect(
    id: &str,
    def: &BackendDefinition,
    slot: &RwLock<Option<StdioGuard>>,
) -> Result<()> {
    let mut cmd = build_command(def)?;
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn backend '{id}'"))?;

    let stdout = match child.stdout.take() {
        Some(s) => s,
        None => {
            let _ = child.kill().await;
            return Err(anyhow!("failed to capture stdout from backend '{id}'"));
        }
    };
    let stdin = match child.stdin.take() {
        Some(s) => s,
        None => {
            let _ = child.kill().await;
            return Err(anyhow!("failed to capture stdin from backend '{id}'"));
        }
    };

    let timeout = Duration::from_secs(def.effective_timeout_seconds());
    let session = match tokio::time::timeout(timeout, ().serve((stdout, stdin))).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(anyhow!("MCP handshake with backend '{id}' failed: {e}"));
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(anyhow!("MCP handshake with backend '{id}' timed out"));
        }
    };

    if let Some(peer) = session.peer_info() {
        tracing::info!(
            backend = id,
            server_name = %peer.server_info.name,
            server_version = %peer.server_info.version,
            "stdio handshake complete"
        );
    }

    *slot.write().await = Some(StdioGuard::new(child, session));
    Ok(())
}

/// Returns `(original_name, description, input_schema)` triples.
pub async fn list_tools(
    id: &str,
    def: &BackendDefinition,
    slot: &RwLock<Option<StdioGuard>>,
) -> Result<Vec<(String, String, Value)>> {
    let guard = slot.read().await;
    let stdio_guard = guard
        .as_ref()
        .ok_or_else(|| anyhow!("backend '{id}' not connected"))?;

    let timeout = Duration::from_secs(def.effective_timeout_seconds());
    let tools = tokio::time::timeout(timeout, stdio_guard.session().list_all_tools())
        .await
        .map_err(|_| anyhow!("tool discovery on backend '{id}' timed out"))?
        .map_err(|e| anyhow!("tool discovery on backend '{id}' failed: {e}"))?;

    Ok(tools
        .into_iter()
        .map(|t| {
            let description = t.description.clone().unwrap_or_default().to_string();
            let input_schema =
                serde_json::to_value(&t.input_schema).unwrap_or_else(|_| json!({}));
            (t.name.to_string(), description, input_schema)
        })
        .collect())
}

/// Forward a `tools/call`. Never returns an `Err` — every failure mode
/// becomes an in-band `isError: true` result.
pub async fn call_tool(
    id: &str,
    def: &BackendDefinition,
    slot: &RwLock<Option<StdioGuard>>,
    original_name: &str,
    arguments: Value,
) -> Value {
    let guard = slot.read().await;
    let Some(stdio_guard) = guard.as_ref() else {
        return error_result(&format!("backend '{id}' not connected"));
    };

    let params = CallToolRequestParams {
        meta: None,
        name: original_name.to_string().into(),
        arguments: arguments.as_object().cloned(),
        task: None,
    };

    let timeout = Duration::from_secs(def.effective_timeout_seconds());
    let result = tokio::time::timeout(timeout, stdio_guard.session().call_tool(params)).await;

    let result = match result {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return error_result(&format!("tool call '{original_name}' failed: {e}")),
        Err(_) => {
            return error_result(&format!(
                "tool call '{original_name}' on backend '{id}' timed out"
            ));
        }
    };

    let content: Vec<Value> = result
        .content
        .into_iter()
        .map(|c| normalize_content(&c.raw))
        .collect();
    let is_error = result.is_error.unwrap_or(false);

    json!({"content": content, "isError": is_error})
}

/// Render one rmcp content block as MCP wire JSON, falling back to a
/// stringified debug representation for anything `serde_json` can't encode.
fn normalize_content(raw: &RawContent) -> Value {
    serde_json::to_value(raw)
        .unwrap_or_else(|_| json!({"type": "text", "text": format!("{raw:?}")}))
}

/// Release the session and kill the child, if any.
pub async fn disconnect(id: &str, slot: &RwLock<Option<StdioGuard>>) {
    if let Some(guard) = slot.write().await.take() {
        tracing::debug!(backend = id, "tearing down stdio backend");
        guard.teardown().await;
    }
}

/// `tools/list` probe with a fixed 5s timeout. Never returns an `Err`.
pub async fn health_check(slot: &RwLock<Option<StdioGuard>>) -> Value {
    let start = std::time::Instant::now();
    let guard = slot.read().await;
    let Some(stdio_guard) = guard.as_ref() else {
        return json!({"ok": false, "latency_ms": 0, "error": "not connected"});
    };

    let outcome = tokio::time::timeout(HEALTH_TIMEOUT, stdio_guard.session().list_all_tools()).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(_)) => json!({"ok": true, "latency_ms": latency_ms}),
        Ok(Err(e)) => json!({"ok": false, "latency_ms": latency_ms, "error": e.to_string()}),
        Err(_) => json!({"ok": false, "latency_ms": latency_ms, "error": "health check timed out"}),
    }
}

fn error_result(message: &str) -> Value {
    json!({"content": [{"type": "text", "text": message}], "isError": true})
}
