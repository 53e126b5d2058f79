use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::plugin::{Direction, Interest, Plugin, PluginError, PluginSpec, Verdict};
use crate::relay::{SessionContext, SessionState};

fn default_buf_size() -> usize {
    10 * 1024 * 1024
}

fn default_delay() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StreamlineParams {
    #[serde(default = "default_buf_size")]
    buf_size: usize,
    #[serde(default = "default_delay")]
    delay_read_seconds: f64,
    #[serde(default = "default_delay")]
    delay_write_seconds: f64,
}

/// Releases data only in blocks of `bufSize` bytes, each after a random
/// delay
///
/// A receiver that throttles its input can signal the sender through the
/// timing of backpressure. Buffering whole blocks and adding jitter bounds
/// the rate of such a channel at the cost of throughput.
#[derive(Debug)]
pub struct StreamlinePlugin {
    label: String,
    buf_size: usize,
    delay_read: Duration,
    delay_write: Duration,
    buffers: DashMap<(Uuid, Direction), BytesMut>,
}

impl StreamlinePlugin {
    pub fn new(
        label: impl Into<String>,
        buf_size: usize,
        delay_read: Duration,
        delay_write: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            buf_size,
            delay_read,
            delay_write,
            buffers: DashMap::new(),
        }
    }

    pub fn build(spec: &PluginSpec<'_>) -> Result<Arc<dyn Plugin>, ConfigError> {
        let params: StreamlineParams = spec.parse_params()?;
        if params.buf_size == 0 {
            return Err(spec.invalid("bufSize must be > 0"));
        }
        let delay = |name: &str, seconds: f64| {
            Duration::try_from_secs_f64(seconds).map_err(|e| spec.invalid(format!("{name}: {e}")))
        };
        Ok(Arc::new(Self::new(
            spec.label(),
            params.buf_size,
            delay("delayReadSeconds", params.delay_read_seconds)?,
            delay("delayWriteSeconds", params.delay_write_seconds)?,
        )))
    }

    /// Sleep for a random time in `[0, max)`
    async fn jitter(max: Duration) {
        let max_ms = max.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let delay = Duration::from_millis(OsRng.gen_range(0..max_ms));
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl Plugin for StreamlinePlugin {
    fn kind(&self) -> &'static str {
        "streamline"
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
        let block = {
            let mut buf = self.buffers.entry((session.id(), direction)).or_default();
            buf.extend_from_slice(&chunk);
            let full = buf.len() / self.buf_size * self.buf_size;
            (full > 0).then(|| buf.split_to(full).freeze())
        };

        let Some(block) = block else {
            return Ok(Verdict::Consume);
        };

        Self::jitter(self.delay_write).await;
        debug!(plugin = %self.label, %direction, len = block.len(), "Releasing block");
        // The leg does not read again until this returns
        Self::jitter(self.delay_read).await;
        Ok(Verdict::Forward(block))
    }

    async fn on_eof(
        &self,
        direction: Direction,
        session: &SessionContext,
    ) -> Result<Option<Bytes>, PluginError> {
        let rest = self
            .buffers
            .remove(&(session.id(), direction))
            .map(|(_, buf)| buf.freeze())
            .filter(|buf| !buf.is_empty());
        if rest.is_some() {
            Self::jitter(self.delay_write).await;
        }
        Ok(rest)
    }

    async fn on_session_end(&self, session: &SessionContext, _state: SessionState) {
        for direction in Direction::ALL {
            self.buffers.remove(&(session.id(), direction));
        }
    }
}
