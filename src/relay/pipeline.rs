//! Ordered stage execution for one direction

use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::context::{AbortReason, SessionContext};
use crate::plugin::{Chain, Direction, Plugin, PluginError, Verdict};

/// Result of pushing data through the pipeline
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct StageOutput {
    /// Bytes to write to the destination, in order
    pub chunks: Vec<Bytes>,
    /// A stage ended the direction; the leg must close its destination
    pub ended: bool,
}

/// The stages of one chain that are interested in one direction
#[derive(Debug)]
pub(crate) struct Pipeline {
    direction: Direction,
    stages: Vec<Arc<dyn Plugin>>,
}

impl Pipeline {
    pub fn new(chain: &Chain, direction: Direction) -> Self {
        let mut stages: Vec<_> = chain
            .plugins()
            .iter()
            .filter(|p| p.interest().includes(direction))
            .cloned()
            .collect();
        if direction == Direction::Inbound {
            stages.reverse();
        }
        Self { direction, stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Some stage refuses the direction before any data
    pub fn is_closed_at_start(&self, session: &SessionContext) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.is_closed(self.direction, session))
    }

    pub async fn push(
        &self,
        chunk: Bytes,
        session: &SessionContext,
    ) -> Result<StageOutput, AbortReason> {
        if self.stages.is_empty() {
            return Ok(StageOutput {
                chunks: vec![chunk],
                ended: false,
            });
        }
        self.run_from(vec![chunk], false, session).await
    }

    /// Source hit end of stream: flush every stage in order
    pub async fn finish(&self, session: &SessionContext) -> Result<Vec<Bytes>, AbortReason> {
        if self.stages.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.run_from(Vec::new(), true, session).await?.chunks)
    }

    async fn run_from(
        &self,
        input: Vec<Bytes>,
        mut flushing: bool,
        session: &SessionContext,
    ) -> Result<StageOutput, AbortReason> {
        let mut pending = input;

        for stage in &self.stages {
            let mut next = Vec::with_capacity(pending.len());
            let mut ended = false;

            for chunk in pending {
                if ended {
                    break;
                }
                let verdict =
                    call_plugin(stage.as_ref(), stage.on_chunk(self.direction, chunk, session))
                        .await?;
                match verdict {
                    Verdict::Forward(bytes) => push_non_empty(&mut next, bytes),
                    Verdict::Consume => {}
                    Verdict::EndOfStream(bytes) => {
                        push_non_empty(&mut next, bytes);
                        ended = true;
                        tracing::debug!(
                            plugin = stage.label(),
                            direction = %self.direction,
                            "Plugin ended the direction"
                        );
                    }
                    Verdict::Terminate(reason) => {
                        return Err(AbortReason::PluginTerminated {
                            plugin: stage.label().to_string(),
                            reason,
                        })
                    }
                }
            }

            if flushing && !ended {
                if let Some(rest) =
                    call_plugin(stage.as_ref(), stage.on_eof(self.direction, session)).await?
                {
                    push_non_empty(&mut next, rest);
                }
            }
            // Everything downstream of an ended stage is flushed too
            flushing |= ended;
            pending = next;
        }

        Ok(StageOutput {
            chunks: pending,
            ended: flushing,
        })
    }
}

fn push_non_empty(out: &mut Vec<Bytes>, bytes: Bytes) {
    if !bytes.is_empty() {
        out.push(bytes);
    }
}

/// Run a plugin call, turning errors and panics into a session fault
pub(crate) async fn call_plugin<T, F>(plugin: &dyn Plugin, call: F) -> Result<T, AbortReason>
where
    F: Future<Output = Result<T, PluginError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(AbortReason::PluginFault {
            plugin: plugin.label().to_string(),
            source,
        }),
        Err(panic) => Err(AbortReason::PluginFault {
            plugin: plugin.label().to_string(),
            source: PluginError::Panicked(panic_message(panic.as_ref())),
        }),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
