//! Error types for the central post office.

use thiserror::Error;

/// Errors surfaced by the broker.
#[derive(Error, Debug)]
pub enum CentralError {
    /// Configuration is invalid; the broker refuses to start.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Socket or filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Protocol-level failure while building outbound traffic.
    #[error(transparent)]
    Protocol(#[from] courier_proto::ProtocolError),
}
