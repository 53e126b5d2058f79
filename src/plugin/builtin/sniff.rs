use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::error::ConfigError;
use crate::plugin::{Direction, Interest, Plugin, PluginError, PluginSpec, Verdict};
use crate::relay::SessionContext;

/// How payload is rendered in the log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decode {
    #[default]
    Base64,
    Hex,
    /// Printable ASCII, everything else escaped
    #[serde(alias = "str")]
    String,
}

impl Decode {
    pub fn render(self, data: &[u8]) -> String {
        match self {
            Decode::Base64 => base64::engine::general_purpose::STANDARD.encode(data),
            Decode::Hex => hex::encode(data),
            Decode::String => data.escape_ascii().to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SniffParams {
    #[serde(default)]
    decode: Decode,
}

/// Logs every chunk passing by, in both directions
#[derive(Debug)]
pub struct SniffPlugin {
    label: String,
    decode: Decode,
}

impl SniffPlugin {
    pub fn new(label: impl Into<String>, decode: Decode) -> Self {
        Self {
            label: label.into(),
            decode,
        }
    }

    pub fn build(spec: &PluginSpec<'_>) -> Result<Arc<dyn Plugin>, ConfigError> {
        let params: SniffParams = spec.parse_params()?;
        Ok(Arc::new(Self::new(spec.label(), params.decode)))
    }
}

#[async_trait]
impl Plugin for SniffPlugin {
    fn kind(&self) -> &'static str {
        "sniff"
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn interest(&self) -> Interest {
        Interest::Both
    }

    async fn on_chunk(
        &self,
        direction: Direction,
        chunk: Bytes,
        session: &SessionContext,
    ) -> Result<Verdict, PluginError> {
        let meta = session.meta();
        let (from, to) = match direction {
            Direction::Outbound => (&meta.source, &meta.destination),
            Direction::Inbound => (&meta.destination, &meta.source),
        };
        info!(
            chain = meta.chain_name(),
            call = %meta.call,
            %from,
            %to,
            len = chunk.len(),
            data = %self.decode.render(&chunk),
            "data"
        );
        Ok(Verdict::Forward(chunk))
    }
}
