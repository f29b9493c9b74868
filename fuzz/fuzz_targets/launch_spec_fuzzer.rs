//! Fuzz target for command line and control channel parsing
//!
//! Driver specs and control lines come from the operator, but a FIFO is
//! writable by anything with file access. Both parsers must reject garbage
//! with an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skyrelay_core::{ControlCommand, DriverLaunch};

fuzz_target!(|data: &str| {
    let _ = DriverLaunch::parse(data);
    if let Ok(command) = ControlCommand::parse(data) {
        let _ = format!("{command:?}");
    }
});
