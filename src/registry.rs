//! Backend registry — owns every backend connection and the merged,
//! namespaced tool catalog, and routes calls to the right backend.

use anyhow::{Result, bail};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::backend::{BackendConnection, ToolInfo};
use crate::config::{BackendDefinition, Config};

struct Inner {
    backends: HashMap<String, Arc<BackendConnection>>,
    /// namespaced_name -> (backend, original_name)
    tool_map: HashMap<String, (Arc<BackendConnection>, String)>,
    config: Config,
}

/// Coordinates every upstream backend connection and the tool index built
/// from them. All mutation goes through a single lock so a `tools/list`
/// snapshot and a concurrent `0ne__add` never observe a half-updated index.
pub struct Registry {
    config_path: PathBuf,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(config_path: PathBuf, config: Config) -> Self {
        Self {
            config_path,
            inner: RwLock::new(Inner {
                backends: HashMap::new(),
                tool_map: HashMap::new(),
                config,
            }),
        }
    }

    pub async fn separator(&self) -> String {
        self.inner.read().await.config.settings.separator.clone()
    }

    async fn lazy_connect(&self) -> bool {
        self.inner.read().await.config.settings.lazy_connect
    }

    /// Register every backend found in the loaded config. Backends marked
    /// `enabled: false` are skipped entirely (not even registered, so they
    /// never occupy a prefix slot for uniqueness checks during this pass).
    /// Eagerly connects when `lazy_connect` is false.
    pub async fn load_from_config(&self) -> HashMap<String, String> {
        let separator = self.separator().await;
        let lazy = self.lazy_connect().await;
        let definitions: Vec<(String, BackendDefinition)> = {
            let inner = self.inner.read().await;
            inner
                .config
                .backends
                .iter()
                .map(|(id, def)| (id.clone(), def.clone()))
                .collect()
        };

        let mut results = HashMap::new();
        for (id, def) in definitions {
            if !def.enabled {
                results.insert(id, "disabled".to_string());
                continue;
            }

            let conn = Arc::new(BackendConnection::new(id.clone(), def, separator.clone()));
            {
                let mut inner = self.inner.write().await;
                inner.backends.insert(id.clone(), conn.clone());
            }

            if !lazy {
                match connect_and_index(self, &conn).await {
                    Ok(count) => {
                        results.insert(id, format!("connected ({count} tools)"));
                    }
                    Err(e) => {
                        results.insert(id, format!("error: {e}"));
                        tracing::error!(backend = %conn.id, error = %e, "failed to load backend");
                    }
                }
            } else {
                results.insert(id, "registered (lazy)".to_string());
            }
        }

        results
    }

    /// Connect every enabled backend that isn't connected yet.
    pub async fn ensure_all_connected(&self) {
        let backends: Vec<Arc<BackendConnection>> =
            self.inner.read().await.backends.values().cloned().collect();

        for conn in backends {
            if !conn.enabled().await {
                continue;
            }
            if conn.state().await == crate::backend::BackendState::Connected {
                continue;
            }
            if let Err(e) = connect_and_index(self, &conn).await {
                tracing::warn!(backend = %conn.id, error = %e, "failed to connect backend");
            }
        }
    }

    /// Overwrite the tool-map entries for one backend with a fresh set.
    async fn index_tools(&self, conn: &Arc<BackendConnection>, tools: Vec<ToolInfo>) {
        let mut inner = self.inner.write().await;
        inner.tool_map.retain(|_, (b, _)| b.id != conn.id);
        for tool in tools {
            inner
                .tool_map
                .insert(tool.namespaced_name, (conn.clone(), tool.original_name));
        }
    }

    async fn unindex_backend(&self, backend_id: &str) {
        let mut inner = self.inner.write().await;
        inner.tool_map.retain(|_, (b, _)| b.id != backend_id);
    }

    /// Rebuild `config.backends` from the live backend definitions and save.
    async fn persist(&self) -> Result<()> {
        let snapshot: Vec<(String, Arc<BackendConnection>)> = {
            let inner = self.inner.read().await;
            inner
                .backends
                .iter()
                .map(|(id, conn)| (id.clone(), conn.clone()))
                .collect()
        };

        let mut backends = HashMap::new();
        for (id, conn) in snapshot {
            backends.insert(id, conn.definition().await);
        }

        let mut inner = self.inner.write().await;
        inner.config.backends = backends;
        inner.config.save(&self.config_path)
    }

    pub async fn add_backend(
        &self,
        backend_id: &str,
        definition: BackendDefinition,
        connect: bool,
    ) -> Result<Value> {
        definition.validate(backend_id)?;

        let enabled = definition.enabled;
        let separator = self.separator().await;

        // Check-then-insert happens under a single write-lock guard so two
        // concurrent add_backend calls can never both pass the id/prefix
        // uniqueness checks before either one inserts.
        let conn = {
            let mut inner = self.inner.write().await;
            if inner.backends.contains_key(backend_id) {
                bail!("Backend '{backend_id}' already exists");
            }

            let existing: Vec<Arc<BackendConnection>> = inner.backends.values().cloned().collect();
            for other in &existing {
                let other_def = other.definition().await;
                if other_def.prefix == definition.prefix {
                    bail!(
                        "Prefix '{}' already in use by backend '{}'",
                        definition.prefix,
                        other.id
                    );
                }
            }

            let conn = Arc::new(BackendConnection::new(
                backend_id.to_string(),
                definition,
                separator,
            ));
            inner.backends.insert(backend_id.to_string(), conn.clone());
            conn
        };

        let mut result = json!({"id": backend_id, "state": "registered"});

        if connect && enabled {
            match connect_and_index(self, &conn).await {
                Ok(count) => {
                    result["state"] = json!("connected");
                    result["tool_count"] = json!(count);
                }
                Err(e) => {
                    result["state"] = json!("error");
                    result["error"] = json!(e.to_string());
                }
            }
        }

        self.persist().await?;
        Ok(result)
    }

    pub async fn remove_backend(&self, backend_id: &str) -> Result<Value> {
        let conn = {
            let inner = self.inner.read().await;
            inner
                .backends
                .get(backend_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Backend '{backend_id}' not found"))?
        };

        if conn.state().await == crate::backend::BackendState::Connected {
            conn.disconnect().await;
        }

        self.unindex_backend(backend_id).await;
        self.inner.write().await.backends.remove(backend_id);
        self.persist().await?;
        Ok(json!({"id": backend_id, "removed": true}))
    }

    pub async fn enable_backend(&self, backend_id: &str) -> Result<Value> {
        let conn = {
            let inner = self.inner.read().await;
            inner
                .backends
                .get(backend_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Backend '{backend_id}' not found"))?
        };

        conn.set_enabled(true).await;
        match connect_and_index(self, &conn).await {
            Ok(count) => {
                self.persist().await?;
                Ok(json!({"id": backend_id, "enabled": true, "tool_count": count}))
            }
            Err(e) => {
                self.persist().await?;
                Ok(json!({"id": backend_id, "enabled": true, "error": e.to_string()}))
            }
        }
    }

    pub async fn disable_backend(&self, backend_id: &str) -> Result<Value> {
        let conn = {
            let inner = self.inner.read().await;
            inner
                .backends
                .get(backend_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Backend '{backend_id}' not found"))?
        };

        if conn.state().await == crate::backend::BackendState::Connected {
            conn.disconnect().await;
        }
        conn.set_enabled(false).await;
        self.unindex_backend(backend_id).await;
        self.persist().await?;
        Ok(json!({"id": backend_id, "enabled": false}))
    }

    /// Reconnect and re-enumerate tools for one backend, or all of them
    /// sequentially when `backend_id` is `None`.
    pub async fn refresh(&self, backend_id: Option<&str>) -> Result<HashMap<String, String>> {
        let targets: Vec<Arc<BackendConnection>> = match backend_id {
            Some(id) => {
                let inner = self.inner.read().await;
                vec![
                    inner
                        .backends
                        .get(id)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("Backend '{id}' not found"))?,
                ]
            }
            None => self.inner.read().await.backends.values().cloned().collect(),
        };

        let mut results = HashMap::new();
        for conn in targets {
            if !conn.enabled().await {
                results.insert(conn.id.clone(), "disabled".to_string());
                continue;
            }
            if conn.state().await == crate::backend::BackendState::Connected {
                conn.disconnect().await;
            }
            match connect_and_index(self, &conn).await {
                Ok(count) => {
                    results.insert(conn.id.clone(), format!("refreshed ({count} tools)"));
                }
                Err(e) => {
                    results.insert(conn.id.clone(), format!("error: {e}"));
                }
            }
        }

        Ok(results)
    }

    /// Merged catalog of every connected, enabled backend's namespaced tools,
    /// in MCP `tools/list` wire shape.
    pub async fn list_all_tools(&self) -> Vec<Value> {
        let backends: Vec<Arc<BackendConnection>> =
            self.inner.read().await.backends.values().cloned().collect();

        let mut tools = Vec::new();
        for conn in backends {
            if conn.state().await != crate::backend::BackendState::Connected
                || !conn.enabled().await
            {
                continue;
            }
            for tool in conn.tools().await {
                tools.push(json!({
                    "name": tool.namespaced_name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema,
                }));
            }
        }
        tools
    }

    /// Route a call by namespaced name, lazily connecting the backend if
    /// needed. Never returns `Err` — unknown tools and connect failures
    /// both become an in-band `isError: true` result.
    pub async fn call_tool(&self, namespaced_name: &str, arguments: Value) -> Value {
        let resolved = self
            .inner
            .read()
            .await
            .tool_map
            .get(namespaced_name)
            .cloned();
        let Some((conn, original_name)) = resolved else {
            return json!({
                "content": [{"type": "text", "text": format!("Unknown tool: {namespaced_name}")}],
                "isError": true,
            });
        };

        if conn.state().await != crate::backend::BackendState::Connected {
            if let Err(e) = connect_and_index(self, &conn).await {
                return json!({
                    "content": [{"type": "text", "text": format!("Failed to connect backend '{}': {e}", conn.id)}],
                    "isError": true,
                });
            }
        }

        conn.call_tool(&original_name, arguments).await
    }

    pub async fn list_backends(&self) -> Vec<Value> {
        let backends: Vec<Arc<BackendConnection>> =
            self.inner.read().await.backends.values().cloned().collect();

        let mut out = Vec::new();
        for conn in backends {
            out.push(conn.status().await);
        }
        out
    }

    pub async fn get_backend(&self, backend_id: &str) -> Option<Arc<BackendConnection>> {
        self.inner.read().await.backends.get(backend_id).cloned()
    }
}

/// Connect a backend and index its tools, returning the tool count.
async fn connect_and_index(registry: &Registry, conn: &Arc<BackendConnection>) -> Result<usize> {
    conn.connect().await?;
    let tools = conn.list_tools().await?;
    let count = tools.len();
    registry.index_tools(conn, tools).await;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;
    use crate::config::{BackendType, Settings};
    use std::collections::HashMap as Map;
    use tempfile::tempdir;

    fn http_def(prefix: &str, url: &str, enabled: bool) -> BackendDefinition {
        BackendDefinition {
            backend_type: BackendType::Http,
            prefix: prefix.to_string(),
            enabled,
            description: None,
            timeout_seconds: None,
            tool_cache_ttl_seconds: None,
            url: Some(url.to_string()),
            health_url: None,
            command: None,
            args: Vec::new(),
            env: Map::new(),
            extra: serde_json::Map::new(),
        }
    }

    fn registry_with(backends: Vec<(&str, BackendDefinition)>) -> (Registry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backends.json");
        let mut config = Config::default();
        config.settings = Settings::default();
        for (id, def) in backends {
            config.backends.insert(id.to_string(), def);
        }
        (Registry::new(path, config), dir)
    }

    #[tokio::test]
    async fn load_from_config_skips_disabled_backends() {
        let (registry, _dir) = registry_with(vec![("a", http_def("a", "http://u/a", false))]);
        let results = registry.load_from_config().await;
        assert_eq!(results.get("a").unwrap(), "disabled");
        assert!(registry.get_backend("a").await.is_none());
    }

    #[tokio::test]
    async fn lazy_load_registers_without_connecting() {
        let (registry, _dir) = registry_with(vec![("a", http_def("a", "http://u/a", true))]);
        let results = registry.load_from_config().await;
        assert_eq!(results.get("a").unwrap(), "registered (lazy)");
        let conn = registry.get_backend("a").await.unwrap();
        assert_eq!(conn.state().await, BackendState::Disconnected);
    }

    #[tokio::test]
    async fn add_backend_rejects_duplicate_prefix() {
        let (registry, _dir) = registry_with(vec![]);
        registry
            .add_backend("a", http_def("shared", "http://u/a", true), false)
            .await
            .unwrap();
        let err = registry
            .add_backend("b", http_def("shared", "http://u/b", true), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn add_backend_rejects_duplicate_id() {
        let (registry, _dir) = registry_with(vec![]);
        registry
            .add_backend("a", http_def("a", "http://u/a", true), false)
            .await
            .unwrap();
        let err = registry
            .add_backend("a", http_def("b", "http://u/b", true), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn call_tool_unknown_name_is_in_band_error() {
        let (registry, _dir) = registry_with(vec![]);
        let result = registry.call_tool("nope__ping", json!({})).await;
        assert_eq!(result["isError"], json!(true));
    }

    #[tokio::test]
    async fn remove_backend_unindexes_and_errors_if_missing() {
        let (registry, _dir) = registry_with(vec![]);
        registry
            .add_backend("a", http_def("a", "http://u/a", true), false)
            .await
            .unwrap();
        registry.remove_backend("a").await.unwrap();
        assert!(registry.get_backend("a").await.is_none());
        assert!(registry.remove_backend("a").await.is_err());
    }

    #[tokio::test]
    async fn disable_then_enable_round_trips_enabled_flag() {
        let (registry, _dir) = registry_with(vec![]);
        registry
            .add_backend("a", http_def("a", "http://u/a", true), false)
            .await
            .unwrap();
        registry.disable_backend("a").await.unwrap();
        let conn = registry.get_backend("a").await.unwrap();
        assert!(!conn.enabled().await);
    }

    /// A fixture JSON-RPC server that answers `initialize` and `tools/list`
    /// against a shared, mutable tool set, accepting requests in a loop
    /// (unlike the single-shot fixture in backend/http.rs) so a backend can
    /// be connected, listed, then reconnected against a changed catalog.
    async fn fixture_server(tools: std::sync::Arc<std::sync::Mutex<Vec<Value>>>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let tools = tools.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let body_start = request.find("\r\n\r\n").map(|i| i + 4).unwrap_or(request.len());
                    let body: Value = serde_json::from_str(&request[body_start..]).unwrap_or(json!({}));
                    let method = body.get("method").and_then(|m| m.as_str()).unwrap_or("");
                    let id = body.get("id").cloned().unwrap_or(json!(null));

                    let response_body = match method {
                        "initialize" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
                        "tools/list" => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {"tools": tools.lock().unwrap().clone()},
                        }),
                        _ => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
                    };
                    let payload = response_body.to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                        payload.len(),
                        payload
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}/")
    }

    /// Covers invariant 1 (the merged index matches exactly the connected
    /// backend's tools) and S6 (refresh evicts stale entries when the
    /// upstream's tool set changes) against the real `index_tools` path.
    #[tokio::test]
    async fn index_tools_evicts_stale_entries_on_refresh() {
        let tools = std::sync::Arc::new(std::sync::Mutex::new(vec![
            json!({"name": "ping", "description": "pings", "inputSchema": {}}),
        ]));
        let url = fixture_server(tools.clone()).await;
        let (registry, _dir) = registry_with(vec![]);

        registry
            .add_backend("a", http_def("a", &url, true), true)
            .await
            .unwrap();

        let listed = registry.list_all_tools().await;
        assert!(listed.iter().any(|t| t["name"] == json!("a__ping")));
        assert_eq!(listed.len(), 1);

        *tools.lock().unwrap() = vec![json!({"name": "pong", "description": "", "inputSchema": {}})];
        registry.refresh(Some("a")).await.unwrap();

        let listed = registry.list_all_tools().await;
        assert!(listed.iter().any(|t| t["name"] == json!("a__pong")));
        assert!(!listed.iter().any(|t| t["name"] == json!("a__ping")));
        assert_eq!(listed.len(), 1);
    }
}
