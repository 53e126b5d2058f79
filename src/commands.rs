use tracing::{info, warn};

use crate::config::{Config, ConnectorConfig};
use crate::error::Result;
use crate::plugin::{ChainRegistry, PluginFactory};

/// Validate the configuration and instantiate every chain without relaying
pub fn run_config_check(config: &Config, factory: &PluginFactory) -> Result<ChainRegistry> {
    info!("Checking configuration...");

    crate::config::validate(config)?;
    info!("✓ Configuration is valid");

    match &config.connector {
        ConnectorConfig::Qrexec { program } => {
            info!("Connector: qrexec via {}", program.display());
            if !program.exists() {
                warn!("  ! {} not found, sessions will fail to connect", program.display());
            }
        }
        ConnectorConfig::Command { program, args } => {
            info!("Connector: command {} {}", program.display(), args.join(" "));
        }
    }

    let registry = ChainRegistry::from_config(config, factory)?;
    info!("Checking {} chain(s)...", registry.len());

    for name in registry.chain_names() {
        let chain = registry.resolve(Some(name))?;
        let plugins: Vec<_> = chain.plugins().iter().map(|p| p.kind()).collect();
        if plugins.is_empty() {
            info!("  {name}: no plugins (plain forward)");
        } else {
            info!("  {name}: {}", plugins.join(" -> "));
        }
    }

    info!("✓ All checks passed");
    Ok(registry)
}
