#![no_main]

use libfuzzer_sys::fuzz_target;
use binary_session::core::framing::FramingStateMachine;

fuzz_target!(|data: &[u8]| {
    // Fuzz the framing parser - test for panics and stalls on arbitrary input
    let mut parser = FramingStateMachine::new();
    let _ = parser.parse(data);
});
