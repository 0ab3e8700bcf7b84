#![no_main]

use clarity::providers::compatible::{fragments_from_payload, SseDecoder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Feed the body in uneven chunks to exercise line reassembly.
    let split = data.first().map_or(1, |b| usize::from(*b % 7) + 1);
    let mut decoder = SseDecoder::default();
    let mut lines = Vec::new();
    for chunk in data.chunks(split) {
        match decoder.push(chunk) {
            Ok(payloads) => lines.extend(payloads),
            Err(_) => return,
        }
    }
    lines.extend(decoder.finish());

    for line in &lines {
        let _ = fragments_from_payload("fuzz", line);
    }
});
