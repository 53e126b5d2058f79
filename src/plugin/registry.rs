//! Plugin type factory and chain resolution
//!
//! The [`ChainRegistry`] is built once from configuration. Every plugin
//! descriptor is instantiated at build time, so unknown plugin types and
//! malformed parameters surface before any session starts.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::{builtin, Plugin};
use crate::config::{Config, PluginDescriptor};
use crate::error::{ConfigError, ProxyError, Result};

/// Constructor for one plugin type
pub type PluginConstructor = fn(&PluginSpec<'_>) -> std::result::Result<Arc<dyn Plugin>, ConfigError>;

/// Everything a constructor needs to build one instance
#[derive(Debug)]
pub struct PluginSpec<'a> {
    pub chain: &'a str,
    /// Position inside the chain
    pub index: usize,
    pub kind: &'a str,
    pub params: &'a serde_json::Map<String, serde_json::Value>,
}

impl PluginSpec<'_> {
    pub fn label(&self) -> String {
        format!("{}:{}#{}", self.chain, self.kind, self.index)
    }

    /// Deserialize the parameters into a plugin specific struct
    pub fn parse_params<T: DeserializeOwned>(&self) -> std::result::Result<T, ConfigError> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone()))
            .map_err(|e| self.invalid(e.to_string()))
    }

    pub fn invalid(&self, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidParams {
            plugin: self.label(),
            reason: reason.into(),
        }
    }
}

/// Maps plugin type names to constructors
#[derive(Clone)]
pub struct PluginFactory {
    constructors: HashMap<String, PluginConstructor>,
}

impl PluginFactory {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Factory with every plugin shipped with the proxy
    pub fn with_builtins() -> Self {
        let mut factory = Self::empty();
        builtin::register_all(&mut factory);
        factory
    }

    /// Register (or replace) a plugin type
    pub fn register(&mut self, kind: &str, constructor: PluginConstructor) -> &mut Self {
        self.constructors.insert(kind.to_string(), constructor);
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    fn constructor(
        &self,
        chain: &str,
        descriptor: &PluginDescriptor,
    ) -> std::result::Result<PluginConstructor, ConfigError> {
        self.constructors
            .get(&descriptor.kind)
            .copied()
            .ok_or_else(|| ConfigError::UnknownPluginType {
                chain: chain.to_string(),
                kind: descriptor.kind.clone(),
            })
    }

    /// Fail on a type that is not registered, without building the plugin
    pub fn check_kind(
        &self,
        chain: &str,
        descriptor: &PluginDescriptor,
    ) -> std::result::Result<(), ConfigError> {
        self.constructor(chain, descriptor).map(|_| ())
    }

    pub fn build(
        &self,
        chain: &str,
        index: usize,
        descriptor: &PluginDescriptor,
    ) -> std::result::Result<Arc<dyn Plugin>, ConfigError> {
        let constructor = self.constructor(chain, descriptor)?;
        constructor(&PluginSpec {
            chain,
            index,
            kind: &descriptor.kind,
            params: &descriptor.params,
        })
    }
}

impl Default for PluginFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginFactory")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// A resolved chain, immutable for the lifetime of a session
#[derive(Debug, Clone)]
pub struct Chain {
    name: Option<String>,
    plugins: Arc<[Arc<dyn Plugin>]>,
}

impl Chain {
    /// The empty chain: plain pass-through
    pub fn direct() -> Self {
        Self {
            name: None,
            plugins: Arc::from(Vec::<Arc<dyn Plugin>>::new()),
        }
    }

    pub fn new(name: impl Into<String>, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            name: Some(name.into()),
            plugins: Arc::from(plugins),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Plugins in declared order
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Resolves chain names to ordered plugin instances
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<String, Chain>,
}

impl ChainRegistry {
    /// Instantiate every enabled plugin of every configured chain
    pub fn from_config(config: &Config, factory: &PluginFactory) -> Result<Self> {
        let mut chains = HashMap::with_capacity(config.chains.len());

        for (name, chain_config) in &config.chains {
            let mut plugins = Vec::with_capacity(chain_config.plugins.len());
            for (index, descriptor) in chain_config.plugins.iter().enumerate() {
                if !descriptor.enabled {
                    factory.check_kind(name, descriptor)?;
                    debug!(chain = %name, plugin = %descriptor.kind, index, "Skipping disabled plugin");
                    continue;
                }
                plugins.push(factory.build(name, index, descriptor)?);
            }
            debug!(chain = %name, plugins = plugins.len(), "Chain loaded");
            chains.insert(name.clone(), Chain::new(name.clone(), plugins));
        }

        Ok(Self { chains })
    }

    /// Resolve a chain name; `None` is the direct, plugin-free chain
    pub fn resolve(&self, name: Option<&str>) -> Result<Chain> {
        match name {
            None => Ok(Chain::direct()),
            Some(name) => self
                .chains
                .get(name)
                .cloned()
                .ok_or_else(|| ProxyError::UnknownChain(name.to_string())),
        }
    }

    pub fn chain_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.chains.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
