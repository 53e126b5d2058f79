use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::plugin::{Direction, Interest, Plugin, PluginError, PluginSpec, Verdict};
use crate::relay::{SessionContext, SessionState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ByteLimitParams {
    outbound_limit: i64,
    inbound_limit: i64,
    #[serde(default)]
    total_limit: Option<i64>,
}

/// Byte budgets; `None` is unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub outbound: Option<u64>,
    pub inbound: Option<u64>,
    pub total: Option<u64>,
}

#[derive(Debug, Default)]
struct Usage {
    outbound: u64,
    inbound: u64,
}

impl Usage {
    fn get(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Outbound => self.outbound,
            Direction::Inbound => self.inbound,
        }
    }

    fn add(&mut self, direction: Direction, n: u64) {
        match direction {
            Direction::Outbound => self.outbound += n,
            Direction::Inbound => self.inbound += n,
        }
    }
}

/// Forwards up to a byte budget, then ends the direction
///
/// Input past the budget is read and discarded so the sender never blocks.
#[derive(Debug)]
pub struct ByteLimitPlugin {
    kind: &'static str,
    label: String,
    limits: Limits,
    usage: DashMap<Uuid, Usage>,
}

impl ByteLimitPlugin {
    pub fn new(label: impl Into<String>, limits: Limits) -> Self {
        Self {
            kind: "byte_limit",
            label: label.into(),
            limits,
            usage: DashMap::new(),
        }
    }

    pub fn build(spec: &PluginSpec<'_>) -> Result<Arc<dyn Plugin>, ConfigError> {
        let params: ByteLimitParams = spec.parse_params()?;
        let limit = |name: &str, value: i64| match value {
            -1 => Ok(None),
            v if v >= 0 => Ok(Some(v as u64)),
            v => Err(spec.invalid(format!("{name} must be -1 or >= 0, got {v}"))),
        };
        let limits = Limits {
            outbound: limit("outboundLimit", params.outbound_limit)?,
            inbound: limit("inboundLimit", params.inbound_limit)?,
            total: match params.total_limit {
                Some(v) => limit("totalLimit", v)?,
                None => None,
            },
        };
        Ok(Arc::new(Self::new(spec.label(), limits)))
    }

    /// Caller may talk, the destination may not answer
    pub fn build_one_way(spec: &PluginSpec<'_>) -> Result<Arc<dyn Plugin>, ConfigError> {
        if !spec.params.is_empty() {
            return Err(spec.invalid("takes no parameters"));
        }
        let mut plugin = Self::new(
            spec.label(),
            Limits {
                outbound: None,
                inbound: Some(0),
                total: None,
            },
        );
        plugin.kind = "one_way";
        Ok(Arc::new(plugin))
    }

    fn direction_limit(&self, direction: Direction) -> Option<u64> {
        match direction {
            Direction::Outbound => self.limits.outbound,
            Direction::Inbound => self.limits.inbound,
        }
    }

    /// Bytes still allowed for `direction`, `None` if unlimited
    fn remaining(&self, direction: Direction, usage: &Usage) -> Option<u64> {
        let own = self
            .direction_limit(direction)
            .map(|limit| limit.saturating_sub(usage.get(direction)));
        let total = self
            .limits
            .total
            .map(|limit| limit.saturating_sub(usage.outbound + usage.inbound));
        match (own, total) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[async_trait]
impl Plugin for ByteLimitPlugin {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn interest(&self) -> Interest {
        Interest::Both
    }

    fn is_closed(&self, direction: Direction, _session: &SessionContext) -> bool {
        self.direction_limit(direction) == Some(0) || self.limits.total == Some(0)
    }

    async fn on_chunk(
        &self,
        direction: Direction,
        chunk: Bytes,
        session: &SessionContext,
    ) -> Result<Verdict, PluginError> {
        let mut usage = self.usage.entry(session.id()).or_default();
        let len = chunk.len() as u64;

        match self.remaining(direction, &usage) {
            Some(remaining) if len >= remaining => {
                // remaining <= len, so it fits in usize
                let keep = remaining as usize;
                usage.add(direction, remaining);
                info!(
                    plugin = %self.label,
                    %direction,
                    sent = usage.get(direction),
                    "Byte limit reached"
                );
                Ok(Verdict::EndOfStream(chunk.slice(..keep)))
            }
            _ => {
                usage.add(direction, len);
                Ok(Verdict::Forward(chunk))
            }
        }
    }

    async fn on_session_end(&self, session: &SessionContext, _state: SessionState) {
        self.usage.remove(&session.id());
    }
}
