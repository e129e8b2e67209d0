//! Per-socket broker state.

use std::time::Instant;

use courier_proto::Deframer;

/// State for one accepted TCP connection.
///
/// Named by the remote address string. Unauthenticated until a handshake
/// associates it with a client; the client outlives the connection, the
/// connection does not outlive the client.
#[derive(Debug)]
pub(crate) struct PoConnection {
    pub(crate) id: String,
    pub(crate) deframer: Deframer,
    /// Name of the authenticated client, `None` before the handshake.
    pub(crate) client: Option<String>,
    /// Last time this connection answered a ping (or authenticated).
    pub(crate) last_pong: Instant,
}

impl PoConnection {
    pub(crate) fn new(id: String, max_message_size: usize) -> Self {
        Self {
            id,
            deframer: Deframer::new(max_message_size),
            client: None,
            last_pong: Instant::now(),
        }
    }
}
