//! Fuzz target for selective field encryption
//!
//! # Strategy
//!
//! - Round trip: arbitrary field values encrypted and decrypted under
//!   the same secret
//! - Tampering: arbitrary ciphertext mutations before decryption
//! - Wrong secrets: decrypt and re-encrypt under mismatched keys
//!
//! # Invariants
//!
//! - NEVER panic, even on corrupted ciphertext
//! - decrypt(encrypt(m)) == m under the same secret
//! - Tampered ciphertext or a wrong secret yields an error, not silent
//!   corruption of the tamper-free fields

#![no_main]

use arbitrary::Arbitrary;
use courier_crypto::{decrypt_fields, encrypt_fields, re_encrypt};
use courier_proto::{Address, Message};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    secret: Vec<u8>,
    other_secret: Vec<u8>,
    value: String,
    nested: u32,
    tamper_byte: u8,
    tamper_at: usize,
}

fuzz_target!(|input: Input| {
    let from: Address = "fuzz.io".parse().expect("static address is valid");
    let mut message = Message::publish(&from, "t", "1.fuzz");
    message.put_dotted("cred", input.value.clone()).expect("valid path");
    message.put_dotted("deep.nested", input.nested).expect("valid path");
    let original = message.clone();

    if encrypt_fields(&mut message, &input.secret, &["cred", "deep.nested"]).is_err() {
        return;
    }
    assert!(!message.has_dotted("cred"));

    // Tampered copy: must error or (for a no-op tamper) still decrypt.
    let mut tampered = message.clone();
    if let Some(ciphertext) = tampered.secure_payload() {
        let mut raw = ciphertext.to_string().into_bytes();
        if !raw.is_empty() {
            let at = input.tamper_at % raw.len();
            raw[at] ^= input.tamper_byte;
        }
        if let Ok(text) = String::from_utf8(raw) {
            tampered.set_secure_payload(text);
            let _ = decrypt_fields(&mut tampered, &input.secret);
        }
    }

    // Wrong-secret re-encryption must not succeed silently unless the
    // secrets happen to be equal.
    let mut hop = message.clone();
    if input.secret != input.other_secret {
        let _ = re_encrypt(&mut hop, &input.other_secret, &input.secret);
    }

    // The untampered message still round-trips.
    decrypt_fields(&mut message, &input.secret).expect("round trip decrypts");
    assert_eq!(message, original);
});
