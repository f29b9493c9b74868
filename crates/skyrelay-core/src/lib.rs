//! Connection state for the skyrelay broker.
//!
//! Everything here is plain data driven by the broker's routing loop: counted
//! [`Message`]s, per-connection [`Queue`]s, [`Client`] sessions with their
//! subscriptions, and [`Driver`] instances with their device ownership,
//! snoops and restart bookkeeping. Nothing in this crate performs I/O.
//!
//! # Threading
//!
//! All types are `!Send` by construction ([`Message`] counts through a
//! `Cell`). They live on the single routing task and are never shared with
//! the I/O tasks, which only see [`bytes::Bytes`] chunks.

#![forbid(unsafe_code)]

pub mod client;
pub mod control;
pub mod driver;
pub mod error;
pub mod message;
pub mod queue;
pub mod registry;
pub mod subscription;

pub use client::{AllProps, Client};
pub use control::ControlCommand;
pub use driver::{Driver, DriverLaunch, DriverState, LocalLaunch, RemoteLaunch};
pub use error::{CoreError, Result};
pub use message::Message;
pub use queue::{DEFAULT_WRITE_CHUNK, Queue};
pub use registry::{ConnId, ConnIdAllocator, Registry};
pub use subscription::{Property, Subscriptions};
