//! Hand-rolled JSON-RPC 2.0 MCP protocol handler: session bookkeeping,
//! `initialize`/`tools/list`/`tools/call` routing, and admin/backend
//! dispatch for `tools/call`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::admin;
use crate::registry::Registry;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "mcp-0ne";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Deserialize)]
pub struct GatewayRequest {
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct GatewayResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

#[derive(Debug, Serialize)]
pub struct GatewayError {
    pub code: i32,
    pub message: String,
}

impl GatewayResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(GatewayError {
                code,
                message: message.into(),
            }),
        }
    }

    /// A parse-error response with no request id, for bodies that never
    /// even deserialized into a `GatewayRequest`.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::error(None, -32700, message)
    }
}

/// Tracks which opaque session ids have completed `initialize`. Unknown or
/// missing session ids are auto-initialized rather than rejected, matching
/// the gateway's tolerance for stateless clients.
pub struct GatewayProtocol {
    registry: Arc<Registry>,
    sessions: RwLock<HashMap<String, bool>>,
}

impl GatewayProtocol {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Handle one JSON-RPC request, returning the response and the session
    /// id to echo back to the client (freshly minted if none was supplied).
    pub async fn handle_request(
        &self,
        request: GatewayRequest,
        session_id: Option<String>,
    ) -> (GatewayResponse, String) {
        let req_id = request.id.clone();

        if request.jsonrpc.as_deref() != Some("2.0") {
            return (
                GatewayResponse::error(req_id, -32600, "Invalid Request: missing jsonrpc 2.0"),
                session_id.unwrap_or_default(),
            );
        }

        let session_id = session_id.unwrap_or_else(|| format!("session_{}", Uuid::new_v4().simple()));
        {
            let mut sessions = self.sessions.write().await;
            sessions.entry(session_id.clone()).or_insert(false);
        }

        if request.method == "initialize" {
            self.sessions.write().await.insert(session_id.clone(), true);
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": SERVER_NAME, "version": SERVER_VERSION},
            });
            return (GatewayResponse::success(req_id, result), session_id);
        }

        // Auto-initialize for stateless clients that skip the handshake.
        let initialized = *self.sessions.read().await.get(&session_id).unwrap_or(&false);
        if !initialized {
            self.sessions.write().await.insert(session_id.clone(), true);
        }

        let response = match request.method.as_str() {
            "tools/list" => self.handle_tools_list(req_id).await,
            "tools/call" => self.handle_tools_call(req_id, &request.params).await,
            other => GatewayResponse::error(req_id, -32601, format!("Method not found: {other}")),
        };

        (response, session_id)
    }

    async fn handle_tools_list(&self, req_id: Option<Value>) -> GatewayResponse {
        let mut tools = admin::tool_definitions();
        tools.extend(self.registry.list_all_tools().await);
        GatewayResponse::success(req_id, json!({"tools": tools}))
    }

    async fn handle_tools_call(&self, req_id: Option<Value>, params: &Value) -> GatewayResponse {
        let Some(tool_name) = params.get("name").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
        else {
            return GatewayResponse::error(req_id, -32602, "Invalid params: missing tool name");
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        if let Some(result) = admin::handle(tool_name, &arguments, &self.registry).await {
            return GatewayResponse::success(req_id, result);
        }

        let result = self.registry.call_tool(tool_name, arguments).await;
        GatewayResponse::success(req_id, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::path::PathBuf;

    fn protocol() -> GatewayProtocol {
        let registry = Arc::new(Registry::new(PathBuf::from("/tmp/does-not-matter.json"), Config::default()));
        GatewayProtocol::new(registry)
    }

    fn request(method: &str, params: Value) -> GatewayRequest {
        GatewayRequest {
            jsonrpc: Some("2.0".to_string()),
            id: Some(json!(1)),
            method: method.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn bad_jsonrpc_version_is_rejected_before_session_creation() {
        let protocol = protocol();
        let req = GatewayRequest {
            jsonrpc: Some("1.0".to_string()),
            id: Some(json!(1)),
            method: "initialize".to_string(),
            params: json!({}),
        };
        let (resp, session_id) = protocol.handle_request(req, None).await;
        assert_eq!(resp.error.unwrap().code, -32600);
        assert!(session_id.is_empty());
        assert!(protocol.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn initialize_mints_a_session_and_marks_it_ready() {
        let protocol = protocol();
        let (resp, session_id) = protocol.handle_request(request("initialize", json!({})), None).await;
        assert!(resp.result.is_some());
        assert!(!session_id.is_empty());
        assert_eq!(protocol.sessions.read().await.get(&session_id), Some(&true));
    }

    #[tokio::test]
    async fn unknown_session_auto_initializes_instead_of_rejecting() {
        let protocol = protocol();
        let (resp, session_id) = protocol
            .handle_request(request("tools/list", json!({})), Some("unseen-session".to_string()))
            .await;
        assert!(resp.result.is_some());
        assert_eq!(protocol.sessions.read().await.get(&session_id), Some(&true));
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let protocol = protocol();
        let (resp, _) = protocol.handle_request(request("bogus/method", json!({})), None).await;
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn tools_call_without_name_is_invalid_params() {
        let protocol = protocol();
        let (resp, _) = protocol.handle_request(request("tools/call", json!({})), None).await;
        assert_eq!(resp.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn tools_list_merges_admin_and_backend_tools() {
        let protocol = protocol();
        let (resp, _) = protocol.handle_request(request("tools/list", json!({})), None).await;
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 7); // admin tools only, no backends registered
    }
}
