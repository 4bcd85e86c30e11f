#![no_main]

use libfuzzer_sys::fuzz_target;
use binary_session::core::framing::FramingStateMachine;

fuzz_target!(|input: (Vec<u8>, Vec<u8>)| {
    // First vector is the stream, second decides where reads end
    let (stream, cuts) = input;
    let mut parser = FramingStateMachine::new();
    let mut pending = Vec::new();
    let mut offset = 0;
    for cut in cuts.iter().map(|c| *c as usize).chain(std::iter::once(stream.len())) {
        let end = (offset + cut).min(stream.len());
        pending.extend_from_slice(&stream[offset..end]);
        offset = end;
        match parser.parse(&pending) {
            Ok((_, consumed)) => {
                pending.drain(..consumed);
            }
            Err(_) => return,
        }
    }
});
