//! Post office runtime for the Courier message fabric.
//!
//! A post office hosts mailboxes for the actors of one process and routes
//! messages between them and the rest of the fabric. Local traffic never
//! touches the network; foreign traffic flows over a single long-lived TCP
//! link to the central post office, with automatic reconnection,
//! re-authentication, and subscription refresh.
//!
//! # Usage
//!
//! ```no_run
//! use courier_office::{OfficeConfig, PostOffice};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OfficeConfig::load("office.json")?;
//! let office = PostOffice::start(config)?;
//!
//! let io = office.create_mailbox("io")?;
//! let mut m = io.create_publish("sensor.temperature");
//! m.put_dotted("temp", 21.5)?;
//! io.send(m);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod link;
mod mailbox;
mod office;

pub use config::OfficeConfig;
pub use error::OfficeError;
pub use mailbox::Mailbox;
pub use office::PostOffice;
