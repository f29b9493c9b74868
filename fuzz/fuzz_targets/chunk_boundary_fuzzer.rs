//! Fuzz target for read boundaries
//!
//! # Invariants
//!
//! - Splitting a stream at arbitrary offsets yields the same elements as
//!   feeding it whole

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skyrelay_proto::StreamParser;

#[derive(Debug, Arbitrary)]
struct Input {
    data: Vec<u8>,
    splits: Vec<u16>,
}

fuzz_target!(|input: Input| {
    let mut whole = StreamParser::new();
    let Ok(expected) = whole.feed(&input.data) else { return };

    let mut cuts: Vec<usize> = input.splits.iter().map(|&s| usize::from(s) % (input.data.len() + 1)).collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut chunked = StreamParser::new();
    let mut got = Vec::new();
    let mut start = 0;
    for cut in cuts.into_iter().chain(std::iter::once(input.data.len())) {
        match chunked.feed(&input.data[start..cut]) {
            Ok(elements) => got.extend(elements),
            Err(e) => panic!("chunked feed failed where whole feed succeeded: {e}"),
        }
        start = cut;
    }
    assert_eq!(got, expected);
});
