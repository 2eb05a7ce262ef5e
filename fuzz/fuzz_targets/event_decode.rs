//! Fuzz target for InboundEvent::decode
//!
//! Live channel frames come straight off the network. Decoding must never
//! panic: anything malformed, oversized or of an unknown type is an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_proto::InboundEvent;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = InboundEvent::decode(text);
    }
});
