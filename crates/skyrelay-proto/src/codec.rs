//! Incremental stream parser.
//!
//! Connections deliver the protocol as an unframed stream of XML elements,
//! split at arbitrary byte boundaries. [`StreamParser`] turns those chunks
//! into complete top-level [`Element`]s.
//!
//! Parsing happens in two passes. A byte scanner tracks markup depth across
//! chunk boundaries (tags, quoted attribute values, comments, CDATA,
//! processing instructions) so every byte is scanned exactly once, no matter
//! how many chunks a large BLOB spans. When the scanner sees a top-level
//! element close, the element's bytes are handed to `quick-xml` to build the
//! tree.
//!
//! # Invariants
//!
//! - Elements are yielded in stream order, each as soon as its closing tag
//!   arrives.
//! - Any error poisons the stream; the caller closes the connection.

use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};

use crate::{
    element::Element,
    errors::{ProtocolError, Result},
};

/// Default ceiling for a single buffered element (64 MiB).
pub const DEFAULT_MAX_ELEMENT_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Between tags
    Content,
    /// Just saw `<`
    Open,
    /// Inside a start or end tag; `prev` is the last byte outside quotes
    Tag { kind: TagKind, quote: Option<u8>, prev: u8 },
    /// Saw `<!`, collecting bytes to tell comments, CDATA and declarations apart
    Bang { seen: usize },
    /// `<!-- ... -->`, counting trailing dashes
    Comment { dashes: usize },
    /// `<![CDATA[ ... ]]>`, counting trailing brackets
    CData { brackets: usize },
    /// `<? ... ?>`
    Instruction { question: bool },
    /// `<!DOCTYPE ...>` and friends
    Declaration,
}

const COMMENT_OPEN: &[u8] = b"--";
const CDATA_OPEN: &[u8] = b"[CDATA[";

/// Per-connection incremental parser.
#[derive(Debug)]
pub struct StreamParser {
    /// Unconsumed bytes; index 0 is stream offset `consumed`
    buf: Vec<u8>,
    /// Stream offset of `buf[0]`
    consumed: u64,
    state: Scan,
    depth: usize,
    /// Start of the top-level element being scanned
    element_start: Option<usize>,
    /// Start of the tag being scanned
    tag_start: usize,
    max_element_size: usize,
    poisoned: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Create a parser with the default element size limit.
    pub fn new() -> Self {
        Self::with_max_element_size(DEFAULT_MAX_ELEMENT_SIZE)
    }

    /// Create a parser that rejects elements larger than `max` bytes.
    pub fn with_max_element_size(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            consumed: 0,
            state: Scan::Content,
            depth: 0,
            element_start: None,
            tag_start: 0,
            max_element_size: max,
            poisoned: false,
        }
    }

    /// Bytes held for an element that has not closed yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed one chunk and collect every element it completes.
    ///
    /// Partial input is retained for the next call. After an error the
    /// parser keeps failing.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Element>> {
        if self.poisoned {
            return Err(ProtocolError::Malformed("stream already failed".to_string()));
        }
        match self.feed_inner(chunk) {
            Ok(elements) => Ok(elements),
            Err(e) => {
                self.poisoned = true;
                self.buf.clear();
                Err(e)
            },
        }
    }

    fn feed_inner(&mut self, chunk: &[u8]) -> Result<Vec<Element>> {
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);

        let mut ranges = Vec::new();
        for pos in scan_from..self.buf.len() {
            let b = self.buf[pos];
            if let Some(range) = self.step(pos, b)? {
                ranges.push(range);
            }
        }

        let mut elements = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            elements.push(build_element(&self.buf[start..end])?);
        }

        let keep_from = if let Some(start) = self.element_start {
            start
        } else if self.state == Scan::Content {
            self.buf.len()
        } else {
            self.tag_start
        };

        let pending = self.buf.len() - keep_from;
        if pending > self.max_element_size {
            return Err(ProtocolError::ElementTooLarge {
                size: pending,
                max: self.max_element_size,
            });
        }

        self.buf.drain(..keep_from);
        self.consumed += keep_from as u64;
        self.tag_start = self.tag_start.saturating_sub(keep_from);
        self.element_start = self.element_start.map(|s| s - keep_from);

        Ok(elements)
    }

    /// Advance the scanner by one byte. Returns the byte range of a completed
    /// top-level element.
    fn step(&mut self, pos: usize, b: u8) -> Result<Option<(usize, usize)>> {
        match self.state {
            Scan::Content => {
                if b == b'<' {
                    self.tag_start = pos;
                    self.state = Scan::Open;
                } else if self.depth == 0 && !b.is_ascii_whitespace() {
                    return Err(ProtocolError::StrayText { offset: self.consumed + pos as u64 });
                }
            },
            Scan::Open => {
                self.state = match b {
                    b'/' => Scan::Tag { kind: TagKind::End, quote: None, prev: b },
                    b'?' => Scan::Instruction { question: false },
                    b'!' => Scan::Bang { seen: 0 },
                    _ => Scan::Tag { kind: TagKind::Start, quote: None, prev: b },
                };
            },
            Scan::Tag { kind, quote: Some(q), .. } => {
                let quote = if b == q { None } else { Some(q) };
                self.state = Scan::Tag { kind, quote, prev: 0 };
            },
            Scan::Tag { kind, quote: None, prev } => {
                if b == b'>' {
                    self.state = Scan::Content;
                    return self.close_tag(kind, prev == b'/', pos);
                }
                let quote = (b == b'"' || b == b'\'').then_some(b);
                self.state = Scan::Tag { kind, quote, prev: b };
            },
            Scan::Bang { seen } => {
                // Bytes after "<!" so far, including this one
                let prefix = &self.buf[self.tag_start + 2..=pos];
                self.state = if prefix == COMMENT_OPEN {
                    Scan::Comment { dashes: 0 }
                } else if prefix == CDATA_OPEN {
                    Scan::CData { brackets: 0 }
                } else if COMMENT_OPEN.starts_with(prefix) || CDATA_OPEN.starts_with(prefix) {
                    Scan::Bang { seen: seen + 1 }
                } else if b == b'>' {
                    Scan::Content
                } else {
                    Scan::Declaration
                };
            },
            Scan::Comment { dashes } => {
                self.state = match b {
                    b'-' => Scan::Comment { dashes: dashes + 1 },
                    b'>' if dashes >= 2 => Scan::Content,
                    _ => Scan::Comment { dashes: 0 },
                };
            },
            Scan::CData { brackets } => {
                self.state = match b {
                    b']' => Scan::CData { brackets: brackets + 1 },
                    b'>' if brackets >= 2 => Scan::Content,
                    _ => Scan::CData { brackets: 0 },
                };
            },
            Scan::Instruction { question } => {
                self.state = if b == b'>' && question {
                    Scan::Content
                } else {
                    Scan::Instruction { question: b == b'?' }
                };
            },
            Scan::Declaration => {
                if b == b'>' {
                    self.state = Scan::Content;
                }
            },
        }
        Ok(None)
    }

    fn close_tag(
        &mut self,
        kind: TagKind,
        self_closing: bool,
        pos: usize,
    ) -> Result<Option<(usize, usize)>> {
        match kind {
            TagKind::Start if self_closing => {
                if self.depth == 0 {
                    return Ok(Some((self.tag_start, pos + 1)));
                }
            },
            TagKind::Start => {
                if self.depth == 0 {
                    self.element_start = Some(self.tag_start);
                }
                self.depth += 1;
            },
            TagKind::End => {
                if self.depth == 0 {
                    return Err(ProtocolError::Unbalanced {
                        offset: self.consumed + self.tag_start as u64,
                    });
                }
                self.depth -= 1;
                if self.depth == 0 {
                    let start = self.element_start.take().unwrap_or(self.tag_start);
                    return Ok(Some((start, pos + 1)));
                }
            },
        }
        Ok(None)
    }
}

/// Build the tree for one complete element.
fn build_element(bytes: &[u8]) -> Result<Element> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    let mut reader = Reader::from_str(text);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(open_element(&start)?),
            Event::Empty(start) => {
                let element = open_element(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.push_child(element),
                    None => return Ok(element),
                }
            },
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ProtocolError::Malformed("unexpected end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.push_child(element),
                    None => return Ok(element),
                }
            },
            Event::Text(raw) => {
                let unescaped = raw.unescape()?;
                if let Some(top) = stack.last_mut() {
                    if !unescaped.trim().is_empty() {
                        top.push_text(&unescaped);
                    }
                }
            },
            Event::CData(raw) => {
                let data = raw.into_inner();
                let data = std::str::from_utf8(&data).map_err(|_| ProtocolError::InvalidUtf8)?;
                if let Some(top) = stack.last_mut() {
                    top.push_text(data);
                }
            },
            Event::Eof => {
                return Err(ProtocolError::Malformed("element ended prematurely".to_string()));
            },
            _ => {},
        }
    }
}

fn open_element(start: &BytesStart<'_>) -> Result<Element> {
    let tag = std::str::from_utf8(start.name().as_ref())
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();
    let mut element = Element::new(tag);
    for attribute in start.attributes() {
        let attribute = attribute?;
        let key =
            std::str::from_utf8(attribute.key.as_ref()).map_err(|_| ProtocolError::InvalidUtf8)?;
        let value = attribute.unescape_value()?;
        element.set_attribute(key, value.into_owned());
    }
    Ok(element)
}
