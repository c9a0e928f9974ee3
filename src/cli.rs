use clap::Parser;
use std::path::PathBuf;

use crate::config;

#[derive(Parser)]
#[command(
    name = "mcp0ne",
    version,
    about = "MCP gateway that federates upstream MCP servers into one tool catalog"
)]
pub struct Cli {
    /// Path to the backend registry config file.
    #[arg(long, default_value_os_t = config::default_config_path())]
    pub config: PathBuf,

    /// Host to bind the HTTP transport to.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind the HTTP transport to.
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error). Falls back to
    /// `MCP_0NE_LOG_LEVEL`/`RUST_LOG`, then `info`.
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn effective_host(&self) -> String {
        self.host.clone().unwrap_or_else(config::default_host)
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(config::default_port)
    }

    pub fn effective_log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(config::default_log_level_env)
    }
}
