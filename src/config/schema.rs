use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ordered plugin list applied to sessions invoked with this chain name
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
}

/// One configured plugin activation inside a chain
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Registered plugin type, e.g. `timeout`
    #[serde(rename = "type")]
    pub kind: String,

    /// Whether this plugin is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Plugin specific parameters, validated by the plugin constructor
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectorConfig {
    /// Reach the next hop through `qrexec-client-vm <domain> <call>`
    #[serde(rename_all = "camelCase")]
    Qrexec {
        #[serde(default = "default_qrexec_client")]
        program: PathBuf,
    },
    /// Run an arbitrary command; `{domain}`, `{service}` and `{call}` in
    /// arguments are replaced with the next hop's values
    #[serde(rename_all = "camelCase")]
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub output: LogOutput,
    /// Directory of the daily rolling log file, used by `file` output and
    /// when journald is unreachable
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Where diagnostics go. stderr of a qrexec service is forwarded to the
/// calling domain, so it is only used when asked for explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Journald,
    File,
    Stderr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

pub(crate) const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

// Default value functions
pub(crate) fn default_enabled() -> bool {
    true
}

fn default_qrexec_client() -> PathBuf {
    PathBuf::from("/usr/lib/qubes/qrexec-client-vm")
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_close_grace_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig::Qrexec {
            program: default_qrexec_client(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            directory: None,
        }
    }
}

impl RelayConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl PluginDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            enabled: true,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

impl Config {
    /// Add or replace a chain, mostly useful when building configs in code
    pub fn with_chain(mut self, name: &str, plugins: Vec<PluginDescriptor>) -> Self {
        self.chains.insert(
            name.to_string(),
            ChainConfig {
                description: None,
                plugins,
            },
        );
        self
    }
}
