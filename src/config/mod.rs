//! Declarative configuration: chains, connector, relay tuning and logging

pub mod loader;
pub mod schema;

pub use loader::{load_default, load_from_path, validate};
pub use schema::{
    ChainConfig, Config, ConnectorConfig, LogFormat, LogOutput, LoggingConfig, PluginDescriptor, RelayConfig,
};
