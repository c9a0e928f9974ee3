pub mod guard;
pub mod http;
pub mod stdio;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Instant;
use tokio::sync::RwLock;

use crate::config::BackendDefinition;

/// Connection state of a backend, per the gateway's lifecycle model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Disconnected => "disconnected",
            BackendState::Connecting => "connecting",
            BackendState::Connected => "connected",
            BackendState::Error => "error",
        }
    }
}

/// A tool advertised by a backend, already namespaced for the merged catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub original_name: String,
    pub namespaced_name: String,
    pub description: String,
    pub input_schema: Value,
    pub backend_id: String,
}

/// Build the namespaced name for a tool: `prefix` + `separator` + `original_name`.
pub fn namespace(prefix: &str, separator: &str, original_name: &str) -> String {
    format!("{prefix}{separator}{original_name}")
}

/// Mutable runtime attributes of a backend connection.
struct Runtime {
    state: BackendState,
    error_message: Option<String>,
    tools: Vec<ToolInfo>,
    tools_indexed_at: Option<Instant>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            state: BackendState::Disconnected,
            error_message: None,
            tools: Vec::new(),
            tools_indexed_at: None,
        }
    }
}

/// The transport-specific half of a backend — the one thing that actually
/// differs between an HTTP and a stdio upstream.
enum TransportState {
    Http,
    Stdio(RwLock<Option<guard::StdioGuard>>),
}

/// One upstream MCP server, reachable over either HTTP or stdio.
///
/// Every operation is exposed through the same five methods regardless of
/// transport; the enum in `transport` picks which implementation runs.
pub struct BackendConnection {
    pub id: String,
    separator: String,
    definition: RwLock<BackendDefinition>,
    runtime: RwLock<Runtime>,
    transport: TransportState,
}

impl BackendConnection {
    pub fn new(id: String, definition: BackendDefinition, separator: String) -> Self {
        let transport = match definition.backend_type {
            crate::config::BackendType::Http => TransportState::Http,
            crate::config::BackendType::Stdio => TransportState::Stdio(RwLock::new(None)),
        };
        Self {
            id,
            separator,
            definition: RwLock::new(definition),
            runtime: RwLock::new(Runtime::default()),
            transport,
        }
    }

    pub async fn definition(&self) -> BackendDefinition {
        self.definition.read().await.clone()
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.definition.write().await.enabled = enabled;
    }

    pub async fn enabled(&self) -> bool {
        self.definition.read().await.enabled
    }

    pub async fn state(&self) -> BackendState {
        self.runtime.read().await.state
    }

    pub async fn error_message(&self) -> Option<String> {
        self.runtime.read().await.error_message.clone()
    }

    pub async fn tools(&self) -> Vec<ToolInfo> {
        self.runtime.read().await.tools.clone()
    }

    /// Status summary for admin introspection (`0ne__discover`, `list_backends`).
    pub async fn status(&self) -> Value {
        let def = self.definition().await;
        let rt = self.runtime.read().await;
        json!({
            "id": self.id,
            "type": def.backend_type.as_str(),
            "prefix": def.prefix,
            "state": rt.state.as_str(),
            "enabled": def.enabled,
            "description": def.description,
            "tool_count": rt.tools.len(),
            "error": rt.error_message,
        })
    }

    /// `DISCONNECTED|ERROR -> CONNECTING -> CONNECTED` on success. A no-op
    /// success if already connected.
    pub async fn connect(&self) -> Result<()> {
        if matches!(self.state().await, BackendState::Connected) {
            return Ok(());
        }

        {
            let mut rt = self.runtime.write().await;
            rt.state = BackendState::Connecting;
            rt.error_message = None;
        }

        let def = self.definition().await;
        let result = match &self.transport {
            TransportState::Http => http::connect(&def).await.map(|()| ()),
            TransportState::Stdio(slot) => stdio::connect(&self.id, &def, slot).await,
        };

        let mut rt = self.runtime.write().await;
        match result {
            Ok(()) => {
                rt.state = BackendState::Connected;
                tracing::info!(backend = %self.id, "connected");
                Ok(())
            }
            Err(e) => {
                rt.state = BackendState::Error;
                rt.error_message = Some(e.to_string());
                tracing::error!(backend = %self.id, error = %e, "failed to connect");
                Err(e)
            }
        }
    }

    /// Release all resources, reset to `DISCONNECTED`. Safe in any state.
    pub async fn disconnect(&self) {
        if let TransportState::Stdio(slot) = &self.transport {
            stdio::disconnect(&self.id, slot).await;
        }

        let mut rt = self.runtime.write().await;
        rt.state = BackendState::Disconnected;
        rt.tools.clear();
        rt.tools_indexed_at = None;
        tracing::info!(backend = %self.id, "disconnected");
    }

    /// Cached list if fresh, otherwise re-queries the upstream and replaces
    /// the cache. On failure the old cache (if any) is left intact.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let def = self.definition().await;
        {
            let rt = self.runtime.read().await;
            if let Some(indexed_at) = rt.tools_indexed_at
                && !rt.tools.is_empty()
                && indexed_at.elapsed().as_secs() < def.effective_tool_cache_ttl_seconds()
            {
                return Ok(rt.tools.clone());
            }
        }

        let raw = match &self.transport {
            TransportState::Http => http::list_tools(&def).await,
            TransportState::Stdio(slot) => stdio::list_tools(&self.id, &def, slot).await,
        };

        match raw {
            Ok(raw_tools) => {
                let tools: Vec<ToolInfo> = raw_tools
                    .into_iter()
                    .map(|(name, description, input_schema)| ToolInfo {
                        namespaced_name: namespace(&def.prefix, &self.separator, &name),
                        original_name: name,
                        description,
                        input_schema,
                        backend_id: self.id.clone(),
                    })
                    .collect();

                let mut rt = self.runtime.write().await;
                rt.tools = tools.clone();
                rt.tools_indexed_at = Some(Instant::now());
                tracing::info!(backend = %self.id, tools = tools.len(), "enumerated tools");
                Ok(tools)
            }
            Err(e) => {
                let mut rt = self.runtime.write().await;
                rt.state = BackendState::Error;
                rt.error_message = Some(e.to_string());
                tracing::error!(backend = %self.id, error = %e, "failed to list tools");
                Err(e)
            }
        }
    }

    /// Forward a call to the upstream. Never returns an `Err` — connection
    /// and protocol failures come back as an in-band `isError: true` result.
    pub async fn call_tool(&self, original_name: &str, arguments: Value) -> Value {
        let def = self.definition().await;
        match &self.transport {
            TransportState::Http => http::call_tool(&self.id, &def, original_name, arguments).await,
            TransportState::Stdio(slot) => {
                stdio::call_tool(&self.id, &def, slot, original_name, arguments).await
            }
        }
    }

    /// Liveness probe with a fixed 5s timeout. Never returns an `Err`.
    pub async fn health_check(&self) -> Value {
        let def = self.definition().await;
        match &self.transport {
            TransportState::Http => http::health_check(&def).await,
            TransportState::Stdio(slot) => stdio::health_check(slot).await,
        }
    }
}
