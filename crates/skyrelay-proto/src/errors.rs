//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while decoding or encoding protocol elements.
///
/// Every decode error is fatal for the connection that produced the bytes:
/// the stream is not resynchronized after malformed input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The XML tokenizer rejected an element.
    #[error("malformed XML: {0}")]
    Malformed(String),

    /// An end tag closed an element that was never opened.
    #[error("unbalanced end tag at byte {offset}")]
    Unbalanced {
        /// Offset of the end tag within the connection's stream
        offset: u64,
    },

    /// Non-whitespace text appeared outside of any element.
    #[error("stray text outside of an element at byte {offset}")]
    StrayText {
        /// Offset of the first stray byte within the connection's stream
        offset: u64,
    },

    /// A single element grew beyond the configured limit before closing.
    #[error("element too large: {size} bytes exceeds maximum {max}")]
    ElementTooLarge {
        /// Bytes buffered for the element so far
        size: usize,
        /// Configured maximum element size
        max: usize,
    },

    /// Element bytes were not valid UTF-8.
    #[error("invalid UTF-8 in element")]
    InvalidUtf8,

    /// Serializing an element failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl From<quick_xml::Error> for ProtocolError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for ProtocolError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Encode(err.to_string())
    }
}
