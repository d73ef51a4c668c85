//! Daemon configuration file

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default log filter when neither `RUST_LOG` nor the config file sets one
pub const DEFAULT_LOG_FILTER: &str = "canlinkd=info,canlink_gateway=info,canlink_adapters=info";

/// Contents of `canlinkd.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub gateway: GatewaySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    /// Socket to listen on
    pub socket_path: Option<PathBuf>,
    /// Time live sessions get to close their adapters on shutdown
    pub close_grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// `tracing` filter directives
    pub filter: Option<String>,
}

impl DaemonConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Config file if one was given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Command line wins over the file, the file over the built-in default
    pub fn socket_path(&self, cli: Option<&Path>) -> PathBuf {
        cli.map(Path::to_path_buf)
            .or_else(|| self.gateway.socket_path.clone())
            .unwrap_or_else(canlink_gateway::default_socket_path)
    }

    pub fn close_grace(&self) -> Duration {
        self.gateway
            .close_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(canlink_gateway::DEFAULT_DRAIN_GRACE)
    }

    pub fn log_filter(&self, verbose: bool) -> String {
        if verbose {
            return "canlinkd=debug,canlink_gateway=debug,canlink_adapters=debug,canlink_core=debug"
                .to_string();
        }
        self.logging
            .filter
            .clone()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
    }
}
