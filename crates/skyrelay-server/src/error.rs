//! Server error types.

use skyrelay_core::CoreError;
use skyrelay_proto::ProtocolError;
use thiserror::Error;

/// Errors that stop the broker.
///
/// Per-connection failures never surface here: the routing loop closes the
/// connection and keeps going.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid startup configuration (no drivers, bad driver spec, etc.)
    #[error("configuration error: {0}")]
    Config(String),

    /// Listener or channel failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A driver could not be launched or connected
    #[error("failed to start driver {driver}: {reason}")]
    Spawn {
        /// Persistent driver name
        driver: String,
        /// Underlying cause
        reason: String,
    },

    /// Wire format error outside any connection
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Connection state error
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
