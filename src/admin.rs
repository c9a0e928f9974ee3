//! Admin toolset: 7 fixed tools under the reserved `0ne__` prefix that let
//! MCP clients manage backends at runtime through the same `tools/call`
//! surface as every other tool.

use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::{BackendDefinition, BackendType};
use crate::registry::Registry;

pub const ADMIN_PREFIX: &str = "0ne";
pub const ADMIN_SEPARATOR: &str = "__";

fn tool_name(name: &str) -> String {
    format!("{ADMIN_PREFIX}{ADMIN_SEPARATOR}{name}")
}

/// MCP `tools/list` entries for the 7 admin tools.
pub fn tool_definitions() -> Vec<Value> {
    let empty_schema = json!({"type": "object", "properties": {}, "additionalProperties": false});
    let id_only_schema = |description: &str| {
        json!({
            "type": "object",
            "properties": {"id": {"type": "string", "description": description}},
            "required": ["id"],
            "additionalProperties": false,
        })
    };

    vec![
        json!({
            "name": tool_name("discover"),
            "description": "List all registered backends with their state, tool count, and description.",
            "inputSchema": empty_schema,
        }),
        json!({
            "name": tool_name("health"),
            "description": "Run health checks on backends. Returns latency and status for each, or for just one if 'id' is given.",
            "inputSchema": {
                "type": "object",
                "properties": {"id": {"type": "string", "description": "Backend ID to scope to (omit for all)"}},
                "additionalProperties": false,
            },
        }),
        json!({
            "name": tool_name("add"),
            "description": "Register a new backend MCP server. Connects and enumerates tools immediately.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "id": {"type": "string", "description": "Unique backend identifier"},
                    "type": {"type": "string", "enum": ["http", "stdio"], "description": "Backend type"},
                    "prefix": {"type": "string", "description": "Tool namespace prefix (must be unique)"},
                    "url": {"type": "string", "description": "MCP endpoint URL (required for http type)"},
                    "health_url": {"type": "string", "description": "Health check URL (optional, http only)"},
                    "command": {"type": "string", "description": "Executable path (required for stdio type)"},
                    "args": {"type": "array", "items": {"type": "string"}, "description": "Command arguments (stdio only)"},
                    "env": {"type": "object", "description": "Environment variables (stdio only)"},
                    "timeout": {"type": "number", "description": "Request timeout in seconds (default: 30 http / 60 stdio)"},
                    "description": {"type": "string", "description": "Human-readable description"},
                    "enabled": {"type": "boolean", "description": "Whether to connect immediately (default: true)"},
                },
                "required": ["id", "type", "prefix"],
                "additionalProperties": false,
            },
        }),
        json!({
            "name": tool_name("remove"),
            "description": "Disconnect and unregister a backend. Removes from config.",
            "inputSchema": id_only_schema("Backend ID to remove"),
        }),
        json!({
            "name": tool_name("enable"),
            "description": "Enable a disabled backend. Connects and enumerates tools.",
            "inputSchema": id_only_schema("Backend ID to enable"),
        }),
        json!({
            "name": tool_name("disable"),
            "description": "Disable a backend without removing it. Disconnects and hides tools.",
            "inputSchema": id_only_schema("Backend ID to disable"),
        }),
        json!({
            "name": tool_name("refresh"),
            "description": "Force reconnect and re-enumerate tools for one or all backends.",
            "inputSchema": {
                "type": "object",
                "properties": {"id": {"type": "string", "description": "Backend ID to refresh (omit for all)"}},
                "additionalProperties": false,
            },
        }),
    ]
}

/// Dispatch a `tools/call` whose name starts with `0ne__`. Returns `None` if
/// `name` isn't an admin tool at all, so the caller can fall through to
/// backend routing.
pub async fn handle(name: &str, arguments: &Value, registry: &Arc<Registry>) -> Option<Value> {
    let action = name.strip_prefix(&format!("{ADMIN_PREFIX}{ADMIN_SEPARATOR}"))?;

    let result = match action {
        "discover" => {
            let backends = registry.list_backends().await;
            let count = backends.len();
            ok_json(json!({"backends": backends, "count": count}))
        }
        "health" => {
            let scoped_id = arguments.get("id").and_then(|v| v.as_str());
            let mut results = serde_json::Map::new();
            match scoped_id {
                Some(id) => {
                    let health = match registry.get_backend(id).await {
                        Some(backend) => backend.health_check().await,
                        None => return Some(error_result(&format!("backend '{id}' not found"))),
                    };
                    results.insert(id.to_string(), health);
                }
                None => {
                    for info in registry.list_backends().await {
                        let id = info["id"].as_str().unwrap_or_default().to_string();
                        let health = match registry.get_backend(&id).await {
                            Some(backend) => backend.health_check().await,
                            None => json!({"ok": false, "error": "not found"}),
                        };
                        results.insert(id, health);
                    }
                }
            }
            ok_json(Value::Object(results))
        }
        "add" => handle_add(arguments, registry).await,
        "remove" => {
            match require_id(arguments) {
                Ok(id) => match registry.remove_backend(id).await {
                    Ok(result) => ok_json(result),
                    Err(e) => error_result(&e.to_string()),
                },
                Err(e) => e,
            }
        }
        "enable" => match require_id(arguments) {
            Ok(id) => match registry.enable_backend(id).await {
                Ok(result) => ok_json(result),
                Err(e) => error_result(&e.to_string()),
            },
            Err(e) => e,
        },
        "disable" => match require_id(arguments) {
            Ok(id) => match registry.disable_backend(id).await {
                Ok(result) => ok_json(result),
                Err(e) => error_result(&e.to_string()),
            },
            Err(e) => e,
        },
        "refresh" => {
            let id = arguments.get("id").and_then(|v| v.as_str());
            match registry.refresh(id).await {
                Ok(results) => ok_json(json!(results)),
                Err(e) => error_result(&e.to_string()),
            }
        }
        _ => error_result(&format!("Unknown admin action: {action}")),
    };

    Some(result)
}

fn require_id(arguments: &Value) -> Result<&str, Value> {
    arguments
        .get("id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| error_result("'id' is required"))
}

async fn handle_add(arguments: &Value, registry: &Arc<Registry>) -> Value {
    let Some(id) = arguments.get("id").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) else {
        return error_result("'id' is required");
    };
    let Some(type_str) = arguments.get("type").and_then(|v| v.as_str()) else {
        return error_result("'type' must be 'http' or 'stdio'");
    };
    let backend_type = match type_str {
        "http" => BackendType::Http,
        "stdio" => BackendType::Stdio,
        _ => return error_result("'type' must be 'http' or 'stdio'"),
    };
    let Some(prefix) = arguments.get("prefix").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    else {
        return error_result("'prefix' is required");
    };

    let url = arguments.get("url").and_then(|v| v.as_str()).map(String::from);
    let command = arguments.get("command").and_then(|v| v.as_str()).map(String::from);

    if backend_type == BackendType::Http && url.is_none() {
        return error_result("'url' is required for http backends");
    }
    if backend_type == BackendType::Stdio && command.is_none() {
        return error_result("'command' is required for stdio backends");
    }

    let args = arguments
        .get("args")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let env = arguments
        .get("env")
        .and_then(|v| v.as_object())
        .map(|o| {
            o.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let definition = BackendDefinition {
        backend_type,
        prefix: prefix.to_string(),
        enabled: arguments.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true),
        description: arguments.get("description").and_then(|v| v.as_str()).map(String::from),
        timeout_seconds: arguments.get("timeout").and_then(|v| v.as_u64()),
        tool_cache_ttl_seconds: None,
        url,
        health_url: arguments.get("health_url").and_then(|v| v.as_str()).map(String::from),
        command,
        args,
        env,
        extra: serde_json::Map::new(),
    };

    match registry.add_backend(id, definition, true).await {
        Ok(result) => ok_json(result),
        Err(e) => error_result(&e.to_string()),
    }
}

fn ok_json(value: Value) -> Value {
    let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    json!({"content": [{"type": "text", "text": text}], "isError": false})
}

fn error_result(message: &str) -> Value {
    json!({"content": [{"type": "text", "text": format!("Error: {message}")}], "isError": true})
}
