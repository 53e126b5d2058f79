use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::seconds_to_limit;
use crate::error::ConfigError;
use crate::plugin::{Direction, Interest, Plugin, PluginError, PluginSpec, Verdict};
use crate::relay::{AbortReason, SessionContext};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TimeoutParams {
    seconds: Option<f64>,
    outbound_seconds: Option<f64>,
    inbound_seconds: Option<f64>,
}

/// Aborts the session when a direction is still open after its deadline
///
/// Each direction gets its own countdown, started with the session and
/// dropped as soon as that direction's leg finishes. Payload is never
/// inspected.
#[derive(Debug)]
pub struct TimeoutPlugin {
    label: String,
    outbound: Option<Duration>,
    inbound: Option<Duration>,
}

impl TimeoutPlugin {
    pub fn new(
        label: impl Into<String>,
        outbound: Option<Duration>,
        inbound: Option<Duration>,
    ) -> Self {
        Self {
            label: label.into(),
            outbound,
            inbound,
        }
    }

    pub fn build(spec: &PluginSpec<'_>) -> Result<Arc<dyn Plugin>, ConfigError> {
        let params: TimeoutParams = spec.parse_params()?;
        let outbound = params.outbound_seconds.or(params.seconds);
        let inbound = params.inbound_seconds.or(params.seconds);
        if outbound.is_none() && inbound.is_none() {
            return Err(spec.invalid("one of seconds, outboundSeconds or inboundSeconds is required"));
        }

        let limit = |seconds: Option<f64>| match seconds {
            Some(s) => seconds_to_limit(s).map_err(|e| spec.invalid(e)),
            None => Ok(None),
        };
        Ok(Arc::new(Self::new(spec.label(), limit(outbound)?, limit(inbound)?)))
    }

    fn limit(&self, direction: Direction) -> Option<Duration> {
        match direction {
            Direction::Outbound => self.outbound,
            Direction::Inbound => self.inbound,
        }
    }
}

#[async_trait]
impl Plugin for TimeoutPlugin {
    fn kind(&self) -> &'static str {
        "timeout"
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn interest(&self) -> Interest {
        Interest::None
    }

    async fn on_session_start(&self, session: &SessionContext) -> Result<(), PluginError> {
        for direction in Direction::ALL {
            let Some(after) = self.limit(direction) else {
                continue;
            };
            let session = session.clone();
            let leg = session.leg_token(direction);
            let plugin = self.label.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = leg.cancelled() => {
                        debug!(%plugin, %direction, "Direction finished before its deadline");
                    }
                    _ = session.cancelled() => {}
                    _ = tokio::time::sleep(after) => {
                        info!(%plugin, %direction, ?after, "Deadline reached");
                        session.terminate(AbortReason::Timeout { plugin, after });
                    }
                }
            });
        }
        Ok(())
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
