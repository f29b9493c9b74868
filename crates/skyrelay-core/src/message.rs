//! Counted outbound messages.
//!
//! A [`Message`] is one serialized element shared by every queue it was
//! pushed on. The queue-held count is explicit: [`Message::retain`] when a
//! queue takes it, [`Message::release`] when that queue finishes writing or
//! drops it. The buffer itself is reference counted by `Rc`, so it is freed
//! exactly once, when the last holder lets go.
//!
//! Counting goes through a `Cell`: messages never leave the routing task.

use std::cell::Cell;

use bytes::Bytes;
use skyrelay_proto::Element;

/// One serialized protocol element plus the number of queues holding it.
#[derive(Debug)]
pub struct Message {
    bytes: Bytes,
    count: Cell<usize>,
}

impl Message {
    /// Wrap already serialized text, dropping a single trailing NUL if
    /// present.
    pub fn from_text(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.ends_with('\0') {
            text.pop();
        }
        Self::from_bytes(Bytes::from(text))
    }

    /// Serialize `element`.
    pub fn from_element(element: &Element) -> Self {
        Self::from_bytes(element.to_bytes())
    }

    fn from_bytes(bytes: Bytes) -> Self {
        Self { bytes, count: Cell::new(0) }
    }

    /// Record one more queue holding this message.
    pub fn retain(&self) {
        self.count.set(self.count.get() + 1);
    }

    /// Record that one queue let go. Returns the remaining count.
    pub fn release(&self) -> usize {
        let count = self.count.get();
        debug_assert!(count > 0, "release without matching retain");
        let remaining = count.saturating_sub(1);
        self.count.set(remaining);
        remaining
    }

    /// Number of queues currently holding this message.
    pub fn count(&self) -> usize {
        self.count.get()
    }

    /// Serialized length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the serialized form is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Serialized bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_starts_at_zero() {
        let msg = Message::from_text("<getProperties version='1.7'/>");
        assert_eq!(msg.count(), 0);
        assert_eq!(msg.len(), 30);
    }

    #[test]
    fn retain_release_balance() {
        let msg = Message::from_text("<a/>");
        msg.retain();
        msg.retain();
        assert_eq!(msg.release(), 1);
        assert_eq!(msg.release(), 0);
    }

    #[test]
    fn from_element_serializes() {
        let element = Element::new("delProperty").with_attribute("device", "Cam");
        let msg = Message::from_element(&element);
        assert_eq!(msg.as_bytes().as_ref(), b"<delProperty device='Cam'/>");
    }

    #[test]
    fn from_text_drops_one_trailing_nul() {
        let msg = Message::from_text("<a/>\0");
        assert_eq!(msg.as_bytes().as_ref(), b"<a/>");

        let msg = Message::from_text("<a/>\0\0");
        assert_eq!(msg.as_bytes().as_ref(), b"<a/>\0");
    }
}
