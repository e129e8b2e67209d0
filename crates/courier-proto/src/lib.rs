//! Wire protocol for the Courier message fabric.
//!
//! Courier is a star-topology message broker: named post offices exchange
//! JSON messages through a central post office, either point-to-point
//! (direct messages, optionally expecting a reply) or as typed broadcasts
//! (publish/subscribe). This crate defines the protocol itself:
//!
//! - [`Address`]: `"<poName>.<mailboxName>"` endpoint names
//! - [`Message`]: the JSON message object with its reserved envelope
//! - [`Deframer`] / [`encode_frame`]: the `[[[<len>]<json>]]` stream framing
//! - [`SubscriptionIndex`]: source-and-type keyed subscriber sets
//!
//! Everything here is pure data and parsing; no I/O, no runtime dependency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod address;
mod error;
mod frame;
mod message;
pub mod radix64;
mod subscription;

pub use address::Address;
pub use error::ProtocolError;
pub use frame::{Deframer, MAX_FRAME_PAYLOAD, encode_frame};
pub use message::{
    CONNECTION_FIELD, ENVELOPE_KEY, Message, SECURE_FIELD, dotted, message_types,
};
pub use subscription::SubscriptionIndex;

/// Well-known name of the central post office.
pub const CENTRAL_NAME: &str = "central";

/// Reserved management mailbox owned by every post office.
pub const MANAGEMENT_MAILBOX: &str = "po";

/// Internal mailbox each post office uses for traffic bound to the central
/// post office. The name is deliberately outside the user-addressable set.
pub const CENTRAL_OUT_MAILBOX: &str = "[({CPO})]";

/// Default TCP port of the central post office.
pub const DEFAULT_PORT: u16 = 4000;
