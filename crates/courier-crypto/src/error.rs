//! Error types for the encryption layer.

use thiserror::Error;

/// Errors from selective field encryption and decryption.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// A field named for encryption is not present in the message.
    #[error("field '{path}' named for encryption is not present")]
    MissingField {
        /// The absent dotted path
        path: String,
    },

    /// Decryption was requested but the message carries no ciphertext.
    #[error("message has no encrypted payload")]
    NotEncrypted,

    /// Ciphertext is not valid base64.
    #[error("encrypted payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// Decryption failed: wrong secret, corrupted ciphertext, or bad
    /// padding.
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// What went wrong
        reason: &'static str,
    },

    /// The recovered plaintext is not the expected JSON object.
    #[error("decrypted payload is not a JSON object: {0}")]
    Payload(#[from] serde_json::Error),

    /// Re-merging recovered fields collided with the message shape.
    #[error("cannot merge recovered field: {0}")]
    Merge(#[from] courier_proto::ProtocolError),
}
