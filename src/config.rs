use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// `MCP_0NE_HOST` default.
pub fn default_host() -> String {
    std::env::var("MCP_0NE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// `MCP_0NE_PORT` default.
pub fn default_port() -> u16 {
    std::env::var("MCP_0NE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8150)
}

/// `MCP_0NE_LOG_LEVEL` default.
pub fn default_log_level_env() -> String {
    std::env::var("MCP_0NE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

/// `MCP_0NE_CONFIG` default — `backends.json` in the current working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var("MCP_0NE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("backends.json"))
}

/// Backend transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Http,
    Stdio,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Http => "http",
            BackendType::Stdio => "stdio",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> Option<u64> {
    None
}

fn default_tool_cache_ttl_seconds() -> Option<u64> {
    None
}

/// A single backend definition as persisted in `backends.json`.
///
/// Unknown keys round-trip through `extra` so an operator-added field
/// survives a load-then-save cycle even though this struct doesn't know
/// about it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendDefinition {
    #[serde(rename = "type")]
    pub backend_type: BackendType,

    pub prefix: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_timeout_seconds", skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default = "default_tool_cache_ttl_seconds", skip_serializing_if = "Option::is_none")]
    pub tool_cache_ttl_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BackendDefinition {
    /// The timeout to use when the field is absent: 30s for http, 60s for stdio.
    pub fn effective_timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(match self.backend_type {
            BackendType::Http => 30,
            BackendType::Stdio => 60,
        })
    }

    pub fn effective_tool_cache_ttl_seconds(&self) -> u64 {
        self.tool_cache_ttl_seconds.unwrap_or(60)
    }

    /// Validate the fields required for this backend's type.
    pub fn validate(&self, id: &str) -> Result<()> {
        match self.backend_type {
            BackendType::Http => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    bail!("backend '{id}': 'url' is required for http backends");
                }
            }
            BackendType::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    bail!("backend '{id}': 'command' is required for stdio backends");
                }
            }
        }
        if self.prefix.is_empty() {
            bail!("backend '{id}': 'prefix' is required");
        }
        if self.prefix == crate::admin::ADMIN_PREFIX {
            bail!(
                "backend '{id}': prefix '{}' is reserved for admin tools",
                crate::admin::ADMIN_PREFIX
            );
        }
        if let Some(t) = self.timeout_seconds
            && t == 0
        {
            bail!("backend '{id}': 'timeout_seconds' must be positive");
        }
        if let Some(t) = self.tool_cache_ttl_seconds
            && t == 0
        {
            bail!("backend '{id}': 'tool_cache_ttl_seconds' must be positive");
        }
        Ok(())
    }
}

fn default_separator() -> String {
    "__".to_string()
}

fn default_lazy_connect() -> bool {
    true
}

fn default_tool_cache_ttl() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Gateway-wide settings, persisted alongside the backend table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_separator")]
    pub separator: String,

    #[serde(default = "default_lazy_connect")]
    pub lazy_connect: bool,

    #[serde(default = "default_tool_cache_ttl")]
    pub tool_cache_ttl: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            lazy_connect: default_lazy_connect(),
            tool_cache_ttl: default_tool_cache_ttl(),
            log_level: default_log_level(),
            extra: serde_json::Map::new(),
        }
    }
}

/// The full persisted document: backend table plus gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub backends: HashMap<String, BackendDefinition>,

    #[serde(default)]
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backends: HashMap::new(),
            settings: Settings::default(),
        }
    }
}

impl Config {
    /// Load the config file at `path`. A missing file yields an all-defaults
    /// config, not an error — this is a leaf utility the registry treats as
    /// "there's simply nothing registered yet".
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config not found, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        for (id, def) in &config.backends {
            def.validate(id)?;
        }

        Ok(config)
    }

    /// Save the config document to `path`, creating parent directories and
    /// writing via a temp-file-then-rename so a crash mid-write never
    /// corrupts the existing file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let body = serde_json::to_string_pretty(self).context("failed to serialize config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, format!("{body}\n"))
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to finalize {}", path.display()))?;

        tracing::info!(path = %path.display(), "config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backends.json");
        let config = Config::load(&path).unwrap();
        assert!(config.backends.is_empty());
        assert_eq!(config.settings.separator, "__");
        assert!(config.settings.lazy_connect);
        assert_eq!(config.settings.tool_cache_ttl, 60);
    }

    #[test]
    fn round_trip_preserves_unknown_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backends.json");

        let raw = serde_json::json!({
            "backends": {
                "a": {
                    "type": "http",
                    "prefix": "a",
                    "url": "http://u/a",
                    "enabled": true,
                    "custom_field": "keep-me"
                }
            },
            "settings": {
                "separator": "__",
                "custom_setting": 42
            }
        });
        std::fs::write(&path, raw.to_string()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.settings.lazy_connect, true); // filled from defaults
        assert_eq!(
            config.settings.extra.get("custom_setting").unwrap(),
            &serde_json::json!(42)
        );
        assert_eq!(
            config.backends["a"].extra.get("custom_field").unwrap(),
            &serde_json::json!("keep-me")
        );

        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn validate_rejects_missing_url_for_http() {
        let def = BackendDefinition {
            backend_type: BackendType::Http,
            prefix: "a".to_string(),
            enabled: true,
            description: None,
            timeout_seconds: None,
            tool_cache_ttl_seconds: None,
            url: None,
            health_url: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            extra: serde_json::Map::new(),
        };
        assert!(def.validate("a").is_err());
    }

    #[test]
    fn validate_rejects_missing_command_for_stdio() {
        let def = BackendDefinition {
            backend_type: BackendType::Stdio,
            prefix: "a".to_string(),
            enabled: true,
            description: None,
            timeout_seconds: None,
            tool_cache_ttl_seconds: None,
            url: None,
            health_url: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            extra: serde_json::Map::new(),
        };
        assert!(def.validate("a").is_err());
    }

    #[test]
    fn validate_rejects_reserved_admin_prefix() {
        let def = BackendDefinition {
            backend_type: BackendType::Http,
            prefix: crate::admin::ADMIN_PREFIX.to_string(),
            enabled: true,
            description: None,
            timeout_seconds: None,
            tool_cache_ttl_seconds: None,
            url: Some("http://u/a".to_string()),
            health_url: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            extra: serde_json::Map::new(),
        };
        let err = def.validate("a").unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }
}
