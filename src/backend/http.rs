//! HTTP JSON-RPC 2.0 backend transport.
//!
//! Every operation opens a fresh `reqwest::Client` and issues one POST —
//! there is no persistent session or connection kept between calls.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::time::{Duration, Instant};

use crate::config::BackendDefinition;

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "mcp-0ne";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

fn client_for(def: &BackendDefinition) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(def.effective_timeout_seconds()))
        .build()
        .context("failed to build HTTP client")
}

async fn post(
    client: &reqwest::Client,
    url: &str,
    body: Value,
) -> Result<Value> {
    let resp = client
        .post(url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;

    if !resp.status().is_success() {
        bail!("{url} returned HTTP {}", resp.status());
    }

    let data: Value = resp
        .json()
        .await
        .with_context(|| format!("{url} returned a non-JSON body"))?;

    if let Some(error) = data.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("request failed");
        bail!("{message}");
    }

    Ok(data)
}

/// Verify reachability with an `initialize` handshake. No session is kept.
pub async fn connect(def: &BackendDefinition) -> Result<()> {
    let url = def.url.as_deref().context("missing url")?;
    let client = client_for(def)?;

    post(
        &client,
        url,
        json!({
            "jsonrpc": "2.0",
            "id": "init",
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION},
            },
        }),
    )
    .await?;

    Ok(())
}

/// Returns `(original_name, description, input_schema)` triples.
pub async fn list_tools(def: &BackendDefinition) -> Result<Vec<(String, String, Value)>> {
    let url = def.url.as_deref().context("missing url")?;
    let client = client_for(def)?;

    let data = post(
        &client,
        url,
        json!({
            "jsonrpc": "2.0",
            "id": "list-tools",
            "method": "tools/list",
            "params": {},
        }),
    )
    .await?;

    let tools = data
        .get("result")
        .and_then(|r| r.get("tools"))
        .and_then(|t| t.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(tools
        .into_iter()
        .map(|t| {
            let name = t.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let description = t
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let input_schema = t.get("inputSchema").cloned().unwrap_or_else(|| json!({}));
            (name, description, input_schema)
        })
        .collect())
}

/// Forward a `tools/call`. Never returns `Err` — every failure mode becomes
/// an in-band `isError: true` result.
pub async fn call_tool(
    backend_id: &str,
    def: &BackendDefinition,
    original_name: &str,
    arguments: Value,
) -> Value {
    let Some(url) = def.url.as_deref() else {
        return error_result(&format!("backend '{backend_id}' has no url configured"));
    };
    let client = match client_for(def) {
        Ok(c) => c,
        Err(e) => return error_result(&e.to_string()),
    };

    let body = json!({
        "jsonrpc": "2.0",
        "id": format!("call-{original_name}"),
        "method": "tools/call",
        "params": {"name": original_name, "arguments": arguments},
    });

    let resp = match client.post(url).json(&body).send().await {
        Ok(r) => r,
        Err(e) if e.is_connect() => {
            return error_result(&format!("backend '{backend_id}' unreachable at {url}"));
        }
        Err(e) => return error_result(&format!("backend '{backend_id}' error: {e}")),
    };

    let data: Value = match resp.json().await {
        Ok(d) => d,
        Err(e) => return error_result(&format!("backend '{backend_id}' error: {e}")),
    };

    if let Some(error) = data.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("tool call failed");
        return error_result(message);
    }

    data.get("result")
        .cloned()
        .unwrap_or_else(|| json!({"content": [], "isError": false}))
}

/// GET `health_url` if configured, otherwise fall back to `tools/list`.
/// Never returns `Err`; latency is reported regardless of outcome.
pub async fn health_check(def: &BackendDefinition) -> Value {
    let start = Instant::now();
    let client = match reqwest::Client::builder().timeout(HEALTH_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => return json!({"ok": false, "latency_ms": 0, "error": e.to_string()}),
    };

    let outcome = if let Some(health_url) = &def.health_url {
        match client.get(health_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) => Ok(body),
                Err(_) => Ok(json!({})),
            },
            Ok(resp) => Err(format!("health check returned HTTP {}", resp.status())),
            Err(e) => Err(e.to_string()),
        }
    } else if let Some(url) = &def.url {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "health",
            "method": "tools/list",
            "params": {},
        });
        match client.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => Ok(json!({})),
            Ok(resp) => Err(format!("health check returned HTTP {}", resp.status())),
            Err(e) => Err(e.to_string()),
        }
    } else {
        Err("no url configured".to_string())
    };

    let latency_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(mut extra) => {
            let mut result = json!({"ok": true, "latency_ms": latency_ms});
            if let (Some(result_obj), Some(extra_obj)) = (result.as_object_mut(), extra.as_object_mut()) {
                for (k, v) in extra_obj {
                    result_obj.entry(k.clone()).or_insert(v.clone());
                }
            }
            result
        }
        Err(error) => json!({"ok": false, "latency_ms": latency_ms, "error": error}),
    }
}

fn error_result(message: &str) -> Value {
    json!({"content": [{"type": "text", "text": message}], "isError": true})
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn def_with_url(url: String) -> BackendDefinition {
        BackendDefinition {
            backend_type: crate::config::BackendType::Http,
            prefix: "a".to_string(),
            enabled: true,
            description: None,
            timeout_seconds: Some(5),
            tool_cache_ttl_seconds: None,
            url: Some(url),
            health_url: None,
            command: None,
            args: Vec::new(),
            env: std::collections::HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Minimal hand-rolled JSON-RPC responder: reads one HTTP request,
    /// replies with a canned JSON-RPC body, then closes.
    async fn serve_once(listener: TcpListener, body: Value) {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = vec![0u8; 8192];
            let _ = socket.read(&mut buf).await;
            let payload = body.to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                payload.len(),
                payload
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    }

    async fn spawn_server(body: Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(serve_once(listener, body));
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn connect_succeeds_on_clean_initialize_response() {
        let url = spawn_server(json!({"jsonrpc": "2.0", "id": "init", "result": {}})).await;
        let def = def_with_url(url);
        assert!(connect(&def).await.is_ok());
    }

    #[tokio::test]
    async fn connect_fails_on_error_payload() {
        let url = spawn_server(
            json!({"jsonrpc": "2.0", "id": "init", "error": {"code": -1, "message": "nope"}}),
        )
        .await;
        let def = def_with_url(url);
        let err = connect(&def).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn list_tools_parses_result_tools() {
        let url = spawn_server(json!({
            "jsonrpc": "2.0",
            "id": "list-tools",
            "result": {"tools": [{"name": "ping", "description": "pings", "inputSchema": {"type": "object"}}]},
        }))
        .await;
        let def = def_with_url(url);
        let tools = list_tools(&def).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].0, "ping");
    }

    #[tokio::test]
    async fn call_tool_unreachable_backend_is_in_band_error() {
        let def = def_with_url("http://127.0.0.1:1/".to_string());
        let result = call_tool("a", &def, "ping", json!({})).await;
        assert_eq!(result["isError"], json!(true));
    }
}
