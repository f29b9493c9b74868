//! Parsed protocol elements.
//!
//! An [`Element`] is the tree form of one top-level protocol message: a tag,
//! its attributes in document order, accumulated character data and child
//! elements. Routing only ever looks at the root tag and the `device`/`name`
//! attributes, plus the `format` of `oneBLOB` children for stream detection.

use std::{fmt::Write as _, io};

use bytes::Bytes;
use quick_xml::escape::escape;

use crate::errors::Result;

/// Attribute naming the device a message targets.
pub const DEVICE_ATTR: &str = "device";

/// Attribute naming the property a message targets.
pub const NAME_ATTR: &str = "name";

/// Tag of a BLOB value update; the only tag treated as BLOB traffic.
pub const SET_BLOB_TAG: &str = "setBLOBVector";

/// Tag of one BLOB member inside a BLOB vector.
pub const ONE_BLOB_TAG: &str = "oneBLOB";

/// One XML element of the protocol stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    /// Create an empty element with the given tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), ..Self::default() }
    }

    /// Builder: append an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    /// Builder: set the character data.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Builder: append a child element.
    #[must_use]
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Element tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Replace the element tag (used to turn `pingRequest` into `pingReply`).
    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = tag.into();
    }

    /// Attribute value, `None` if absent.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Attribute value, empty if absent.
    pub fn attr(&self, name: &str) -> &str {
        self.attribute(name).unwrap_or("")
    }

    /// Set an attribute, replacing an existing value in place.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    /// Attributes in document order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Character data directly inside this element.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub(crate) fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    /// Child elements in document order.
    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub(crate) fn push_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Target device, empty when the message names none.
    pub fn device(&self) -> &str {
        self.attr(DEVICE_ATTR)
    }

    /// Target property, empty when the message names none.
    pub fn name(&self) -> &str {
        self.attr(NAME_ATTR)
    }

    /// Whether this is BLOB traffic for routing purposes.
    pub fn is_blob(&self) -> bool {
        self.tag == SET_BLOB_TAG
    }

    /// Whether any `oneBLOB` member carries a streaming format.
    ///
    /// Stream frames may be dropped for slow clients instead of closing them.
    pub fn has_stream_blob(&self) -> bool {
        self.children
            .iter()
            .any(|c| c.tag == ONE_BLOB_TAG && c.attr("format").contains("stream"))
    }

    /// Serialize the element to `dst`.
    pub fn write_to(&self, dst: &mut impl io::Write) -> Result<()> {
        dst.write_all(self.to_xml().as_bytes())?;
        Ok(())
    }

    /// Serialize the element to a string.
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(64 + self.text.len());
        self.render(&mut out);
        out
    }

    /// Serialize the element into a shareable buffer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_xml())
    }

    fn render(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attributes {
            // Writing into a String cannot fail.
            let _ = write!(out, " {name}='{}'", escape(value.as_str()));
        }

        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for child in &self.children {
            child.render(out);
        }
        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }
}
