//! Plugins shipped with the proxy
//!
//! | type | effect |
//! |---|---|
//! | `pass` | forwards everything unchanged |
//! | `timeout` | aborts the session when a direction outlives its deadline |
//! | `byte_limit` | ends a direction once its byte budget is spent |
//! | `one_way` | `byte_limit` that lets nothing flow back to the caller (alias `stop_dst`) |
//! | `sniff` | logs every chunk |
//! | `count` | rejects sessions beyond a rate limit per chain |
//! | `streamline` | releases data in fixed-size blocks after random delays |

mod byte_limit;
mod count;
mod pass;
mod sniff;
mod streamline;
mod timeout;

pub use byte_limit::ByteLimitPlugin;
pub use count::CountPlugin;
pub use pass::PassPlugin;
pub use sniff::{Decode, SniffPlugin};
pub use streamline::StreamlinePlugin;
pub use timeout::TimeoutPlugin;

use super::PluginFactory;

pub(crate) fn register_all(factory: &mut PluginFactory) {
    factory
        .register("pass", PassPlugin::build)
        .register("timeout", TimeoutPlugin::build)
        .register("byte_limit", ByteLimitPlugin::build)
        .register("one_way", ByteLimitPlugin::build_one_way)
        .register("stop_dst", ByteLimitPlugin::build_one_way)
        .register("sniff", SniffPlugin::build)
        .register("count", CountPlugin::build)
        .register("streamline", StreamlinePlugin::build);
}

/// Seconds from configuration; negative means "no limit"
pub(crate) fn seconds_to_limit(seconds: f64) -> Result<Option<std::time::Duration>, String> {
    if seconds < 0.0 {
        return Ok(None);
    }
    std::time::Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(|e| format!("invalid duration {seconds}: {e}"))
}
