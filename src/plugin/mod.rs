//! Plugin stage contract for relayed qrexec sessions
//!
//! A chain is an ordered list of plugins. Every chunk read from one side of
//! the session passes through the plugins interested in its direction before
//! it is written to the other side.
//!
//! # Architecture
//!
//! - **Outbound** data (caller → next hop) visits plugins in chain order
//! - **Inbound** data (next hop → caller) visits them in reverse order
//! - **Verdicts**: each plugin forwards, rewrites, swallows, ends the
//!   direction, or terminates the session
//! - **Shared instances**: one instance per chain entry; per-session state
//!   is keyed by [`SessionContext::id`] and must be synchronized because
//!   both legs call into the same instance concurrently
//! - **Fail-fast**: plugin errors and panics abort the session
//!
//! # Modules
//!
//! - `registry`: plugin type factory and chain resolution
//! - `builtin`: plugins shipped with the proxy

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

use crate::relay::{SessionContext, SessionState};

pub mod builtin;
pub mod registry;

pub use registry::{Chain, ChainRegistry, PluginFactory, PluginSpec};

/// Direction of a stream leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Caller → next hop
    Outbound,
    /// Next hop → caller
    Inbound,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Outbound, Direction::Inbound];

    pub fn reverse(self) -> Self {
        match self {
            Direction::Outbound => Direction::Inbound,
            Direction::Inbound => Direction::Outbound,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Which payload directions a plugin wants to see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Lifetime only, never sees payload
    None,
    Outbound,
    Inbound,
    Both,
}

impl Interest {
    pub fn includes(self, direction: Direction) -> bool {
        match self {
            Interest::None => false,
            Interest::Both => true,
            Interest::Outbound => direction == Direction::Outbound,
            Interest::Inbound => direction == Direction::Inbound,
        }
    }
}

/// What a plugin decided to do with a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Pass these bytes (original or rewritten) to the next stage
    Forward(Bytes),
    /// Nothing to pass on for now (dropped or buffered)
    Consume,
    /// Pass these bytes on, then end the direction; later input is discarded
    EndOfStream(Bytes),
    /// Abort the whole session
    Terminate(String),
}

/// Plugin-specific errors
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin logic failed
    #[error("{0}")]
    Fault(String),

    /// Plugin I/O error (state files, etc.)
    #[error("Plugin I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Plugin panicked while handling a call
    #[error("Plugin panicked: {0}")]
    Panicked(String),
}

/// A configured plugin instance
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Registered type name
    fn kind(&self) -> &'static str;

    /// Instance label used in diagnostics, e.g. `chain:timeout#0`
    fn label(&self) -> &str;

    fn interest(&self) -> Interest;

    /// Called once, in chain order, before any payload moves
    async fn on_session_start(&self, _session: &SessionContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Whether `direction` is closed before any data arrives
    fn is_closed(&self, _direction: Direction, _session: &SessionContext) -> bool {
        false
    }

    async fn on_chunk(
        &self,
        direction: Direction,
        chunk: Bytes,
        session: &SessionContext,
    ) -> Result<Verdict, PluginError>;

    /// Source reached end of stream; return anything still buffered
    async fn on_eof(
        &self,
        _direction: Direction,
        _session: &SessionContext,
    ) -> Result<Option<Bytes>, PluginError> {
        Ok(None)
    }

    /// Called once after both legs have stopped, whatever the outcome
    async fn on_session_end(&self, _session: &SessionContext, _state: SessionState) {}
}
