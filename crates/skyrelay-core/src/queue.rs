//! Per-connection outbound queue and inbound parser.
//!
//! The queue is the part of a connection the router talks to. Outbound, it is
//! a FIFO of counted [`Message`]s plus the offset already sent from the head.
//! Inbound, it owns the connection's [`StreamParser`].
//!
//! The runtime drives writes through [`Queue::next_chunk`] and
//! [`Queue::advance`]: at most one chunk is in flight at a time, so bytes
//! reach the peer in push order and never interleave within a message.

use std::{collections::VecDeque, rc::Rc};

use bytes::Bytes;
use skyrelay_proto::{Element, ProtocolError, StreamParser};

use crate::{
    error::{CoreError, Result},
    message::Message,
};

/// Largest chunk handed to the writer at once (48 KiB).
pub const DEFAULT_WRITE_CHUNK: usize = 49152;

/// Outbound FIFO and inbound parser for one connection.
#[derive(Debug)]
pub struct Queue {
    pending: VecDeque<Rc<Message>>,
    /// Bytes of the head message already written
    head_sent: usize,
    /// Unsent bytes across all pending messages
    queued_bytes: usize,
    parser: StreamParser,
    attached: bool,
    /// Length of the chunk currently being written
    in_flight: Option<usize>,
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue {
    /// Create a detached, empty queue.
    pub fn new() -> Self {
        Self::with_parser(StreamParser::new())
    }

    /// Create a queue with a preconfigured parser.
    pub fn with_parser(parser: StreamParser) -> Self {
        Self {
            pending: VecDeque::new(),
            head_sent: 0,
            queued_bytes: 0,
            parser,
            attached: false,
            in_flight: None,
        }
    }

    /// Mark the I/O endpoint as bound. Pending output becomes writable.
    pub fn attach(&mut self) {
        self.attached = true;
    }

    /// Whether an I/O endpoint is bound.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Append `message` and take a count on it.
    pub fn push(&mut self, message: &Rc<Message>) {
        message.retain();
        self.queued_bytes += message.len();
        self.pending.push_back(Rc::clone(message));
    }

    /// Next slice of the head message, at most `max` bytes.
    ///
    /// Returns `None` when detached, when a write is already in flight, or
    /// when nothing is pending. A returned chunk must be acknowledged with
    /// [`Queue::advance`] before the next one is handed out.
    pub fn next_chunk(&mut self, max: usize) -> Option<Bytes> {
        if !self.attached || self.in_flight.is_some() || max == 0 {
            return None;
        }

        while self.pending.front().is_some_and(|m| m.is_empty()) {
            self.pop_head();
        }

        let head = self.pending.front()?;
        let end = head.len().min(self.head_sent + max);
        let chunk = head.as_bytes().slice(self.head_sent..end);
        self.in_flight = Some(chunk.len());
        Some(chunk)
    }

    /// Record that `n` bytes of the in-flight chunk were written.
    ///
    /// A fully written head message is released and popped. A zero-byte
    /// write is an error: the connection is dead.
    pub fn advance(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(CoreError::ZeroWrite);
        }
        let Some(chunk) = self.in_flight.take() else {
            return Ok(());
        };
        let n = n.min(chunk);

        self.head_sent += n;
        self.queued_bytes = self.queued_bytes.saturating_sub(n);
        if self.pending.front().is_some_and(|head| self.head_sent >= head.len()) {
            self.pop_head();
        }
        Ok(())
    }

    fn pop_head(&mut self) {
        if let Some(head) = self.pending.pop_front() {
            head.release();
        }
        self.head_sent = 0;
    }

    /// Whether [`Queue::next_chunk`] would hand out a chunk.
    pub fn is_ready(&self) -> bool {
        self.attached && self.in_flight.is_none() && !self.pending.is_empty()
    }

    /// Unsent bytes across all pending messages.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Number of pending messages, including a partially sent head.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed received bytes through the parser.
    pub fn feed(&mut self, data: &[u8]) -> std::result::Result<Vec<Element>, ProtocolError> {
        self.parser.feed(data)
    }

    /// Release every pending message.
    pub fn clear(&mut self) {
        for message in self.pending.drain(..) {
            message.release();
        }
        self.head_sent = 0;
        self.queued_bytes = 0;
        self.in_flight = None;
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.clear();
    }
}
