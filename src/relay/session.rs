//! Session orchestration: lifecycle hooks, both legs, next hop supervision

use futures::FutureExt;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::Child;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::context::{AbortReason, SessionContext, SessionState};
use super::leg::run_leg;
use super::pipeline::{call_plugin, panic_message, Pipeline};
use crate::config::RelayConfig;
use crate::error::{ConnectError, ProxyError, TransportError};
use crate::plugin::{Chain, Direction};
use crate::transport::{BoxedReader, TransportLeg};

/// Bytes delivered per direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub outbound: u64,
    pub inbound: u64,
}

/// Terminal result of a session
#[derive(Debug)]
pub enum SessionOutcome {
    /// Both directions reached end of stream without intervention
    Closed(TransferStats),
    Aborted {
        reason: AbortReason,
        stats: TransferStats,
    },
}

impl SessionOutcome {
    pub fn final_state(&self) -> SessionState {
        match self {
            SessionOutcome::Closed(_) => SessionState::Closed,
            SessionOutcome::Aborted { .. } => SessionState::Aborted,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            SessionOutcome::Closed(_) => 0,
            SessionOutcome::Aborted { reason, .. } => reason.exit_code(),
        }
    }

    pub fn stats(&self) -> TransferStats {
        match self {
            SessionOutcome::Closed(stats) | SessionOutcome::Aborted { stats, .. } => *stats,
        }
    }

    pub fn reason(&self) -> Option<&AbortReason> {
        match self {
            SessionOutcome::Closed(_) => None,
            SessionOutcome::Aborted { reason, .. } => Some(reason),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionOutcome::Closed(_))
    }
}

/// A connected session, ready to relay
#[derive(Debug)]
pub struct RelaySession {
    chain: Chain,
    context: SessionContext,
    local: TransportLeg,
    next_hop: TransportLeg,
    settings: RelayConfig,
}

impl RelaySession {
    pub fn new(
        chain: Chain,
        context: SessionContext,
        local: TransportLeg,
        next_hop: TransportLeg,
    ) -> Self {
        Self {
            chain,
            context,
            local,
            next_hop,
            settings: RelayConfig::default(),
        }
    }

    pub fn with_settings(mut self, settings: RelayConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Relay both directions until the session closes or aborts
    pub async fn run(self) -> SessionOutcome {
        let meta = self.context.meta();
        let span = info_span!(
            "session",
            id = %self.context.id(),
            chain = meta.chain_name(),
            source = %meta.source,
            destination = %meta.destination,
            call = %meta.call,
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> SessionOutcome {
        let RelaySession {
            chain,
            context: ctx,
            local,
            next_hop,
            settings,
        } = self;

        info!(plugins = chain.plugins().len(), "Session starting");

        for plugin in chain.plugins() {
            if let Err(reason) = call_plugin(plugin.as_ref(), plugin.on_session_start(&ctx)).await {
                ctx.terminate(reason);
            }
            if ctx.is_terminated() {
                break;
            }
        }

        let (local_reader, local_writer, _) = local.into_parts();
        let (hop_reader, hop_writer, child) = next_hop.into_parts();
        let (hop_reader, supervisor) = match child {
            Some(child) => {
                let answered = Arc::new(AtomicBool::new(false));
                let reader: BoxedReader = Box::new(AnswerWatch {
                    inner: hop_reader,
                    answered: answered.clone(),
                });
                let task = supervise(child, ctx.clone(), answered, settings.close_grace());
                (reader, Some(tokio::spawn(task)))
            }
            None => (hop_reader, None),
        };

        if !ctx.is_terminated() {
            ctx.set_state(SessionState::Relaying);
        }

        let outbound = Pipeline::new(&chain, Direction::Outbound);
        let inbound = Pipeline::new(&chain, Direction::Inbound);
        let chunk_size = settings.chunk_size;

        let (out_report, in_report) = tokio::join!(
            run_leg(Direction::Outbound, local_reader, hop_writer, &outbound, &ctx, chunk_size),
            run_leg(Direction::Inbound, hop_reader, local_writer, &inbound, &ctx, chunk_size),
        );

        if let Some(mut handle) = supervisor {
            if tokio::time::timeout(settings.close_grace(), &mut handle).await.is_err() {
                warn!(grace = ?settings.close_grace(), "Next hop still running, killing it");
                ctx.shutdown();
                if let Err(e) = handle.await {
                    debug!(error = %e, "Supervisor task failed");
                }
            }
        }

        let reason = ctx.seal();
        // Stop plugin timers and anything else still attached
        ctx.shutdown();

        let stats = TransferStats {
            outbound: out_report.bytes,
            inbound: in_report.bytes,
        };
        let outcome = match reason {
            Some(reason) => SessionOutcome::Aborted { reason, stats },
            None if out_report.drained && in_report.drained => SessionOutcome::Closed(stats),
            None => SessionOutcome::Aborted {
                reason: AbortReason::Cancelled,
                stats,
            },
        };
        ctx.set_state(outcome.final_state());

        let state = outcome.final_state();
        for plugin in chain.plugins() {
            if let Err(panic) = AssertUnwindSafe(plugin.on_session_end(&ctx, state))
                .catch_unwind()
                .await
            {
                let message = panic_message(panic.as_ref());
                warn!(plugin = plugin.label(), %message, "Plugin panicked during session end");
            }
        }

        log_outcome(&outcome);
        outcome
    }
}

fn log_outcome(outcome: &SessionOutcome) {
    let stats = outcome.stats();
    match outcome.reason() {
        None => info!(
            outbound = stats.outbound,
            inbound = stats.inbound,
            "Session closed"
        ),
        Some(reason) if reason.is_expected() => info!(
            outbound = stats.outbound,
            inbound = stats.inbound,
            reason = %reason,
            "Session aborted"
        ),
        Some(reason) => error!(
            outbound = stats.outbound,
            inbound = stats.inbound,
            reason = %reason,
            exit_code = reason.exit_code(),
            "Session aborted"
        ),
    }
}

/// Next hop reader that records whether the hop ever sent data
struct AnswerWatch {
    inner: BoxedReader,
    answered: Arc<AtomicBool>,
}

impl AsyncRead for AnswerWatch {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if buf.filled().len() > before {
            self.answered.store(true, Ordering::Relaxed);
        }
        polled
    }
}

/// Watch the next hop process; a failing exit aborts the session and a
/// stopped session kills the process
///
/// A hop that fails without ever answering was refused (the arbiter denied
/// the call, or the service does not exist). Once it has answered, a failing
/// exit is a transport fault.
async fn supervise(
    mut child: Child,
    ctx: SessionContext,
    answered: Arc<AtomicBool>,
    grace: Duration,
) {
    let pid = child.id();
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => debug!(?pid, "Next hop exited"),
            Ok(status) => {
                // Output written before the exit is still in the pipe
                let inbound_done = ctx.leg_token(Direction::Inbound);
                if tokio::time::timeout(grace, inbound_done.cancelled()).await.is_err() {
                    debug!(?pid, "Inbound leg still busy after next hop exit");
                }

                let code = status.code();
                if answered.load(Ordering::Relaxed) {
                    warn!(?pid, ?code, "Next hop exited with failure");
                    ctx.terminate(AbortReason::Transport(TransportError::NextHopExited { code }));
                } else {
                    warn!(?pid, ?code, "Next hop failed without answering");
                    ctx.terminate(AbortReason::Startup(ProxyError::Connect(ConnectError::Refused(
                        format!("next hop exited with {status} before sending any data"),
                    ))));
                }
            }
            Err(e) => warn!(?pid, error = %e, "Failed to wait for next hop"),
        },
        _ = ctx.cancelled() => {
            if let Err(e) = child.kill().await {
                debug!(?pid, error = %e, "Failed to kill next hop");
            }
        }
    }
}
