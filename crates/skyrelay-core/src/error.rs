//! Error types for connection state.

use skyrelay_proto::ProtocolError;
use thiserror::Error;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by queues, launch specs and control lines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A `[device]@host[:port]` specifier could not be parsed
    #[error("bad remote driver spec: {0}")]
    InvalidRemoteSpec(String),

    /// A control channel line could not be parsed
    #[error("bad control line: {0}")]
    InvalidControl(String),

    /// The writer reported a zero-byte write
    #[error("zero-byte write")]
    ZeroWrite,

    /// The connection's input stream failed to parse
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
