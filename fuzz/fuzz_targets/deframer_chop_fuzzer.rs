//! Fuzz target for de-framer boundary conditions
//!
//! The de-framer faces raw TCP bytes: arbitrary garbage, frames chopped
//! at any boundary, overlapping open sequences, and hostile length
//! headers.
//!
//! # Strategy
//!
//! - Garbage: arbitrary byte runs between and around valid frames
//! - Chopping: the stream is fed in arbitrary-size pieces
//! - Hostile headers: oversize lengths, bad digits, too many digits
//! - Valid frames: embedded payloads that must survive extraction
//!
//! # Invariants
//!
//! - NEVER panic, whatever the stream
//! - Extracted payloads never exceed the configured size limit
//! - Every valid frame embedded between `[`-free garbage is recovered
//!   in order

#![no_main]

use arbitrary::Arbitrary;
use courier_proto::{Deframer, encode_frame};
use libfuzzer_sys::fuzz_target;

const MAX_MESSAGE_SIZE: usize = 1024;

#[derive(Debug, Arbitrary)]
enum Piece {
    Garbage(Vec<u8>),
    Frame(Vec<u8>),
    HostileHeader { digits: Vec<u8>, tail: Vec<u8> },
}

#[derive(Debug, Arbitrary)]
struct Plan {
    pieces: Vec<Piece>,
    chops: Vec<u8>,
}

fuzz_target!(|plan: Plan| {
    let mut stream = Vec::new();
    let mut expected = Vec::new();

    for piece in &plan.pieces {
        match piece {
            Piece::Garbage(bytes) => {
                // `[` could start a real open that swallows later frames;
                // that is legal de-framer behavior but breaks the
                // recovery oracle, so garbage stays bracket-free.
                stream.extend(bytes.iter().map(|&b| if b == b'[' { b'.' } else { b }));
            }
            Piece::Frame(payload) => {
                let payload = &payload[..payload.len().min(MAX_MESSAGE_SIZE)];
                if let Ok(frame) = encode_frame(payload) {
                    stream.extend_from_slice(&frame);
                    expected.push(payload.to_vec());
                }
            }
            Piece::HostileHeader { digits, tail } => {
                stream.extend_from_slice(b"[[[");
                stream.extend(digits.iter().take(8));
                stream.extend(tail.iter().take(16).map(|&b| if b == b'[' { b'.' } else { b }));
            }
        }
    }

    let mut deframer = Deframer::new(MAX_MESSAGE_SIZE);
    let mut recovered = Vec::new();

    let mut fed = 0;
    for &chop in &plan.chops {
        let end = (fed + 1 + chop as usize).min(stream.len());
        deframer.push(&stream[fed..end]);
        fed = end;
        while let Some(payload) = deframer.next_frame() {
            assert!(payload.len() <= MAX_MESSAGE_SIZE);
            recovered.push(payload);
        }
    }
    deframer.push(&stream[fed..]);
    while let Some(payload) = deframer.next_frame() {
        assert!(payload.len() <= MAX_MESSAGE_SIZE);
        recovered.push(payload);
    }

    // Hostile headers may cost the frames that follow them (their fake
    // payload swallows real bytes), so only the garbage-and-frames case
    // has an exact oracle.
    let hostile = plan
        .pieces
        .iter()
        .any(|p| matches!(p, Piece::HostileHeader { .. }));
    if !hostile {
        assert_eq!(recovered, expected, "embedded frames lost or reordered");
    }
});
