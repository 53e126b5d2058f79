use std::io;
use thiserror::Error;

use crate::plugin::Direction;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Malformed invocation: {0}")]
    MalformedInvocation(String),

    #[error("Unknown chain: {0}")]
    UnknownChain(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),

    #[error("Chain '{chain}' references unknown plugin type '{kind}'")]
    UnknownPluginType { chain: String, kind: String },

    #[error("Invalid parameters for plugin '{plugin}': {reason}")]
    InvalidParams { plugin: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Next hop process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("Next hop refused the connection: {0}")]
    Refused(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{direction} leg failed: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("Next hop exited with status {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    NextHopExited { code: Option<i32> },
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Process exit status for a failure that happened before any data moved.
    pub fn exit_code(&self) -> u8 {
        match self {
            ProxyError::Connect(_) => 3,
            ProxyError::MalformedInvocation(_)
            | ProxyError::UnknownChain(_)
            | ProxyError::Config(_)
            | ProxyError::Io(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_exit_codes() {
        assert_eq!(ProxyError::MalformedInvocation("x".into()).exit_code(), 2);
        assert_eq!(ProxyError::UnknownChain("x".into()).exit_code(), 2);
        assert_eq!(
            ProxyError::Config(ConfigError::Validation("x".into())).exit_code(),
            2
        );
        assert_eq!(
            ProxyError::Connect(ConnectError::Refused("denied".into())).exit_code(),
            3
        );
    }

    #[test]
    fn test_next_hop_exit_display() {
        let err = TransportError::NextHopExited { code: Some(126) };
        assert_eq!(err.to_string(), "Next hop exited with status 126");
        let err = TransportError::NextHopExited { code: None };
        assert_eq!(err.to_string(), "Next hop exited with status signal");
    }
}
