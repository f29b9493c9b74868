//! Fuzz target for StreamParser::feed
//!
//! Feeds arbitrary bytes as a single chunk. The parser should NEVER panic:
//! invalid input returns an error and poisons the stream.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skyrelay_proto::StreamParser;

fuzz_target!(|data: &[u8]| {
    let mut parser = StreamParser::with_max_element_size(64 * 1024);
    let _ = parser.feed(data);
});
