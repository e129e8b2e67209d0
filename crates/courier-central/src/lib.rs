//! Central post office: the Courier broker.
//!
//! The broker is the single hop of the star: it authenticates client post
//! offices, snoops their subscription traffic to learn where publishes
//! go, re-encrypts selectively-encrypted payloads per hop, replays
//! subscriptions to restarted sources, pings its peers, and answers the
//! management surface (`manage.status`, `manage.add`, …).
//!
//! # Architecture
//!
//! Routing logic lives in a Sans-IO router: events in, actions out, all
//! broker state owned by one task. [`Central`] is the production glue
//! that feeds it from TCP readers and executes its actions against
//! per-client outbound queues and writer tasks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod connection;
mod error;
pub mod monitor;
mod router;
mod server;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{CentralConfig, ClientEntry, ConfigStore, FileStore, NullStore, OverflowPolicy};
pub use error::CentralError;
pub use monitor::{SystemProbe, TelemetryProbe};
pub use server::Central;

/// Lock a mutex, ignoring poisoning: worker loops never leave shared
/// state in a half-mutated critical section.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
