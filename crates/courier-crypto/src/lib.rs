//! Selective field encryption and peer authentication for Courier.
//!
//! Secrecy in the fabric is per-field, not per-connection: a sender strips
//! chosen fields out of a message, encrypts them under a shared secret, and
//! ships the ciphertext inside the envelope. The central post office can
//! re-wrap that ciphertext for the next hop without ever merging plaintext
//! back into the message.
//!
//! All key material is derived per message from `(secret, from, id)`, so
//! both ends reconstruct it without any key exchange beyond the configured
//! shared secret.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod derive;
mod error;
mod fields;

pub use derive::{authenticator, derive_iv, derive_key};
pub use error::CryptoError;
pub use fields::{decrypt_fields, encrypt_fields, re_encrypt};
