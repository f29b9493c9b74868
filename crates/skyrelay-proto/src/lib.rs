//! Wire protocol for skyrelay.
//!
//! Peers speak an unframed stream of XML elements. This crate turns byte
//! chunks into [`Element`] trees ([`StreamParser`]), serializes elements back
//! to bytes, and classifies elements for routing ([`MessageKind`]).
//!
//! The crate is pure: no I/O, no clocks, no global state.

#![forbid(unsafe_code)]

pub mod codec;
pub mod element;
pub mod errors;
pub mod kind;

pub use codec::{DEFAULT_MAX_ELEMENT_SIZE, StreamParser};
pub use element::{DEVICE_ATTR, Element, NAME_ATTR, ONE_BLOB_TAG, SET_BLOB_TAG};
pub use errors::{ProtocolError, Result};
pub use kind::{BlobHandling, MessageKind};

/// Protocol version announced in broker-originated `getProperties`.
pub const PROTOCOL_VERSION: &str = "1.7";

/// Default TCP port for the broker.
pub const DEFAULT_PORT: u16 = 7624;
