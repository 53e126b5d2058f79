//! Chain-aware relay for Qubes OS qrexec calls
//!
//! The proxy sits between a calling domain and a destination service. The
//! service argument names an optional plugin chain together with the real
//! destination; every byte in either direction passes through that chain.

pub mod commands;
pub mod config;
pub mod error;
pub mod invocation;
pub mod logging;
pub mod plugin;
pub mod relay;
pub mod transport;

pub use error::{ProxyError, Result};
pub use invocation::{InvocationTarget, NextHop};
pub use relay::{Relay, SessionOutcome};
