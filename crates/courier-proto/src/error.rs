//! Error types for the Courier wire protocol.
//!
//! Malformed input on the wire path is reported through explicit results;
//! only the outermost worker loops are allowed to swallow errors.

use thiserror::Error;

/// Errors produced while parsing or constructing protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame payload exceeds the negotiated or encodable size limit.
    #[error("frame payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Size of the offending payload
        size: usize,
        /// The limit that was exceeded
        max: usize,
    },

    /// A post office or mailbox name violates the address grammar.
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address text
        address: String,
        /// Which rule it broke
        reason: &'static str,
    },

    /// A message envelope is missing or structurally invalid.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A dotted path cannot be applied to the message body.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending dotted path
        path: String,
        /// Which rule it broke
        reason: &'static str,
    },

    /// Message payload is not valid JSON.
    #[error("message payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
