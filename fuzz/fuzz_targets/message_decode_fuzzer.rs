//! Fuzz target for message parsing and the dotted-path API
//!
//! # Strategy
//!
//! - Raw bytes: arbitrary input through `Message::from_slice`
//! - Valid messages: programmatically built envelopes round-tripped
//!   through wire JSON
//! - Dotted paths: arbitrary path strings against get/put/has/remove
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - A parsed message has a non-empty, address-valid `from` and a
//!   non-empty `id`
//! - put followed by get on the same path returns the value; remove
//!   undoes put

#![no_main]

use arbitrary::Arbitrary;
use courier_proto::{Address, ENVELOPE_KEY, Message};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    raw: Vec<u8>,
    path: String,
    value: i64,
}

fuzz_target!(|input: Input| {
    // Arbitrary bytes: parse may fail, must not panic.
    if let Ok(message) = Message::from_slice(&input.raw) {
        assert!(!message.from_addr().is_empty());
        assert!(message.from_addr().parse::<Address>().is_ok());
        assert!(!message.id().is_empty());
        let _ = message.major_type();
        let _ = message.from_po();
        let _ = message.to_bytes();
    }

    // A valid message with an arbitrary dotted path driven against the
    // body accessors.
    let from: Address = "fuzz.io".parse().expect("static address is valid");
    let mut message = Message::publish(&from, "fuzz.type", "1.fuzz");

    // Writing through the reserved envelope key is the one way a dotted
    // path may clobber routing metadata; the runtime never does it.
    if input.path.split('.').next() == Some(ENVELOPE_KEY) {
        return;
    }

    if message.put_dotted(&input.path, input.value).is_ok() {
        assert!(message.has_dotted(&input.path));
        assert_eq!(
            message.get_dotted(&input.path).and_then(|v| v.as_i64()),
            Some(input.value)
        );
        let removed = message.remove_dotted(&input.path);
        assert_eq!(removed.and_then(|v| v.as_i64()), Some(input.value));
        assert!(!message.has_dotted(&input.path));
    }

    // Whatever the path did to the body, the envelope survives a wire
    // round trip.
    let bytes = message.to_bytes().expect("message serializes");
    let parsed = Message::from_slice(&bytes).expect("round trip parses");
    assert_eq!(parsed.from_addr(), "fuzz.io");
    assert_eq!(parsed.id(), "1.fuzz");
});
