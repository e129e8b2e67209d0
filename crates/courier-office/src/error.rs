//! Error types for the post office runtime.

use thiserror::Error;

/// Errors surfaced by the post office API.
#[derive(Error, Debug)]
pub enum OfficeError {
    /// Configuration is invalid; the post office refuses to start.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A mailbox with this name already exists in this post office.
    #[error("mailbox '{name}' already exists")]
    DuplicateMailbox {
        /// The duplicate name
        name: String,
    },

    /// The name is reserved for the runtime's own mailboxes.
    #[error("mailbox name '{name}' is reserved")]
    ReservedMailbox {
        /// The reserved name
        name: String,
    },

    /// An address or envelope failed protocol validation.
    #[error(transparent)]
    Protocol(#[from] courier_proto::ProtocolError),

    /// Reading a configuration file failed.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
}
