use std::io;
use thiserror::Error;

/// Unified error type for the tunnel engine
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Obfuscation protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SOCKS negotiation error
    #[error("SOCKS error: {0}")]
    Socks(String),

    /// Connection setup or teardown error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<anyhow::Error> for TunnelError {
    fn from(err: anyhow::Error) -> Self {
        TunnelError::Other(err.to_string())
    }
}
