use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::plugin::{Direction, Interest, Plugin, PluginError, PluginSpec, Verdict};
use crate::relay::SessionContext;

/// Forwards every chunk unchanged
#[derive(Debug)]
pub struct PassPlugin {
    label: String,
}

impl PassPlugin {
    pub fn build(spec: &PluginSpec<'_>) -> Result<Arc<dyn Plugin>, ConfigError> {
        if !spec.params.is_empty() {
            return Err(spec.invalid("takes no parameters"));
        }
        Ok(Arc::new(Self {
            label: spec.label(),
        }))
    }
}

#[async_trait]
impl Plugin for PassPlugin {
    fn kind(&self) -> &'static str {
        "pass"
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn interest(&self) -> Interest {
        Interest::Both
    }

    async fn on_chunk(
        &self,
        _direction: Direction,
        chunk: Bytes,
        _session: &SessionContext,
    ) -> Result<Verdict, PluginError> {
        Ok(Verdict::Forward(chunk))
    }
}
