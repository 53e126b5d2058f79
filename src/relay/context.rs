//! Per-session shared state handed to plugins and legs

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::{ProxyError, TransportError};
use crate::plugin::{Direction, PluginError};

/// Lifecycle of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Starting,
    Relaying,
    Draining,
    Closed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted)
    }
}

/// Why a session ended in [`SessionState::Aborted`]
#[derive(Debug, thiserror::Error)]
pub enum AbortReason {
    #[error("startup failed: {0}")]
    Startup(#[from] ProxyError),

    #[error("plugin '{plugin}' timed out the session after {after:?}")]
    Timeout { plugin: String, after: Duration },

    #[error("plugin '{plugin}' terminated the session: {reason}")]
    PluginTerminated { plugin: String, reason: String },

    #[error("plugin '{plugin}' failed: {source}")]
    PluginFault {
        plugin: String,
        #[source]
        source: PluginError,
    },

    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),

    #[error("session cancelled")]
    Cancelled,
}

impl AbortReason {
    /// Process exit status communicating the termination category
    pub fn exit_code(&self) -> u8 {
        match self {
            AbortReason::Startup(e) => e.exit_code(),
            AbortReason::Timeout { .. } | AbortReason::PluginTerminated { .. } => 4,
            AbortReason::PluginFault { .. } => 5,
            AbortReason::Transport(_) => 6,
            AbortReason::Cancelled => 7,
        }
    }

    /// Plugin-initiated terminations are expected outcomes, not faults
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            AbortReason::Timeout { .. }
                | AbortReason::PluginTerminated { .. }
                | AbortReason::Cancelled
        )
    }
}

/// Who talks to whom in this session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMeta {
    pub chain: Option<String>,
    pub source: String,
    pub destination: String,
    /// The call as forwarded to the next hop, `service[+args]`
    pub call: String,
}

impl SessionMeta {
    pub fn chain_name(&self) -> &str {
        self.chain.as_deref().unwrap_or("-")
    }
}

enum Termination {
    Open,
    Terminated(AbortReason),
    Sealed,
}

struct Inner {
    id: Uuid,
    meta: SessionMeta,
    shutdown: CancellationToken,
    outbound_done: CancellationToken,
    inbound_done: CancellationToken,
    termination: Mutex<Termination>,
    state: watch::Sender<SessionState>,
}

/// Cheaply cloneable handle on a live session
///
/// The first call to [`SessionContext::terminate`] wins; it records the
/// reason and cancels the session token so both legs unblock. Later calls,
/// and every call after the session has sealed its outcome, are no-ops.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<Inner>,
}

impl SessionContext {
    pub fn new(meta: SessionMeta) -> Self {
        Self::with_parent(meta, &CancellationToken::new())
    }

    /// Session whose token is a child of `parent`, so cancelling the parent
    /// cancels the session
    pub fn with_parent(meta: SessionMeta, parent: &CancellationToken) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                meta,
                shutdown: parent.child_token(),
                outbound_done: CancellationToken::new(),
                inbound_done: CancellationToken::new(),
                termination: Mutex::new(Termination::Open),
                state,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn meta(&self) -> &SessionMeta {
        &self.inner.meta
    }

    /// Request session termination. Returns `true` if this call won.
    pub fn terminate(&self, reason: AbortReason) -> bool {
        let won = {
            let mut slot = match self.inner.termination.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            match *slot {
                Termination::Open => {
                    *slot = Termination::Terminated(reason);
                    true
                }
                Termination::Terminated(_) | Termination::Sealed => {
                    tracing::debug!(session = %self.id(), ignored = %reason, "Session already terminating");
                    false
                }
            }
        };
        if won {
            self.inner.shutdown.cancel();
        }
        won
    }

    /// Whether termination was requested or the session was cancelled
    pub fn is_terminated(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the session is terminated, cancelled or finished
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.shutdown.cancelled()
    }

    /// Token that fires when the session stops for any reason
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Token that fires once the leg for `direction` has finished
    pub fn leg_token(&self, direction: Direction) -> CancellationToken {
        match direction {
            Direction::Outbound => self.inner.outbound_done.clone(),
            Direction::Inbound => self.inner.inbound_done.clone(),
        }
    }

    pub fn is_leg_finished(&self, direction: Direction) -> bool {
        self.leg_token(direction).is_cancelled()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        self.inner.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            tracing::debug!(session = %self.inner.id, from = ?*current, to = ?next, "Session state change");
            *current = next;
            true
        });
    }

    pub(crate) fn finish_leg(&self, direction: Direction) {
        self.leg_token(direction).cancel();
    }

    /// Stop accepting terminations and hand out the winning reason, if any
    pub(crate) fn seal(&self) -> Option<AbortReason> {
        let mut slot = match self.inner.termination.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        match std::mem::replace(&mut *slot, Termination::Sealed) {
            Termination::Terminated(reason) => Some(reason),
            Termination::Open | Termination::Sealed => None,
        }
    }

    /// Cancel everything still attached to the session (plugin timers,
    /// process supervision)
    pub(crate) fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.inner.id)
            .field("meta", &self.inner.meta)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
