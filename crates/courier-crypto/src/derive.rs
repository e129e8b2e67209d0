//! Per-message key material and the connect authenticator.
//!
//! Everything is derived with SHA-256 over concatenations the receiver can
//! reproduce: the shared secret, the sender address, and the message id.

use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};

/// Cipher key for one message: the first 16 bytes of
/// `SHA-256(secret ‖ from ‖ id)`.
pub fn derive_key(secret: &[u8], from: &str, id: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(from.as_bytes());
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Initialization vector for one message: the XOR of the two 16-byte
/// halves of `SHA-256(from ‖ id)`.
pub fn derive_iv(from: &str, id: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(from.as_bytes());
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();

    let mut iv = [0u8; 16];
    for i in 0..16 {
        iv[i] = digest[i] ^ digest[i + 16];
    }
    iv
}

/// The handshake authenticator:
/// `base64(SHA-256(secret ‖ poName ‖ messageId))`.
///
/// The central post office recomputes this from its configured secret for
/// the named post office; a mismatch closes the connection.
pub fn authenticator(secret: &[u8], po_name: &str, message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(po_name.as_bytes());
    hasher.update(message_id.as_bytes());
    STANDARD.encode(hasher.finalize())
}
