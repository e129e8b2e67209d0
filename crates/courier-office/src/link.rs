//! The central link: one long-lived TCP connection with auto-reconnect.
//!
//! The link task owns the socket. Each session runs a reader, a writer,
//! and a ping watchdog raced against each other; whichever fails first
//! tears the session down, and the task reconnects after a fixed backoff.
//! The first frame on every socket is the authentication handshake, and a
//! frame that was in flight when the previous socket died is retransmitted
//! right behind it, so the new socket always starts on a frame boundary
//! and per-sender order is preserved.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use courier_crypto::authenticator;
use courier_proto::{Address, Deframer, Message, encode_frame, message_types};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
};

use crate::office::{OfficeInner, lock};

/// Backoff between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Ping watchdog granularity.
const PING_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Link state shared between the link task and the rest of the runtime.
pub(crate) struct LinkShared {
    connected: AtomicBool,
    /// Whether any socket of this process has carried a handshake; decides
    /// `manage.connect` vs `manage.reconnect`.
    ever_handshaken: AtomicBool,
    /// Whether the one-time foreign subscription refresh has run.
    refreshed: AtomicBool,
    /// Ping interval announced by the central post office (ms); zero until
    /// the handshake completes.
    announced_ping_ms: AtomicU64,
    /// Frame size limit; raised when the handshake announces a larger one.
    max_message_size: AtomicUsize,
    last_ping: Mutex<Instant>,
    /// The frame being written when the previous socket died.
    pending: Mutex<Option<Vec<u8>>>,
}

impl LinkShared {
    pub(crate) fn new(max_message_size: usize) -> Self {
        Self {
            connected: AtomicBool::new(false),
            ever_handshaken: AtomicBool::new(false),
            refreshed: AtomicBool::new(false),
            announced_ping_ms: AtomicU64::new(0),
            max_message_size: AtomicUsize::new(max_message_size),
            last_ping: Mutex::new(Instant::now()),
            pending: Mutex::new(None),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn session_ended(&self) {
        self.connected.store(false, Ordering::Release);
        // Stale intervals must not trip the watchdog on the next session
        // before its handshake completes.
        self.announced_ping_ms.store(0, Ordering::Release);
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.max_message_size.load(Ordering::Acquire)
    }

    /// A ping from the central post office arrived.
    pub(crate) fn note_ping(&self) {
        *lock(&self.last_ping) = Instant::now();
    }

    fn ping_silence_ms(&self) -> u64 {
        lock(&self.last_ping).elapsed().as_millis() as u64
    }

    /// The handshake reply arrived. Returns `true` on the first successful
    /// handshake of this process (the caller then refreshes foreign
    /// subscriptions).
    pub(crate) fn handshake_complete(&self, max: Option<u64>, ping_ms: Option<u64>) -> bool {
        if let Some(max) = max {
            let current = self.max_message_size.load(Ordering::Acquire);
            if (max as usize) > current {
                self.max_message_size.store(max as usize, Ordering::Release);
            }
        }
        if let Some(ping_ms) = ping_ms {
            self.announced_ping_ms.store(ping_ms, Ordering::Release);
        }
        *lock(&self.last_ping) = Instant::now();
        self.connected.store(true, Ordering::Release);
        !self.refreshed.swap(true, Ordering::AcqRel)
    }
}

/// Run the link until shutdown: connect, run a session, back off, repeat.
pub(crate) async fn run(office: Arc<OfficeInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let (host, port) = office.cpo_endpoint();
        let stream = tokio::select! {
            result = TcpStream::connect((host, port)) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!(error = %e, "central post office unreachable");
                    if sleep_or_shutdown(&mut shutdown).await {
                        return;
                    }
                    continue;
                }
            },
            _ = shutdown.changed() => return,
        };

        tracing::info!(host, port, "connected to central post office");
        run_session(&office, stream, &mut shutdown).await;
        office.link.session_ended();

        if *shutdown.borrow() {
            return;
        }
        tracing::warn!("link to central post office lost; reconnecting");
        if sleep_or_shutdown(&mut shutdown).await {
            return;
        }
    }
}

/// Returns `true` if shutdown was requested during the backoff.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(RECONNECT_DELAY) => false,
        _ = shutdown.changed() => true,
    }
}

async fn run_session(
    office: &Arc<OfficeInner>,
    stream: TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "cannot set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();

    tokio::select! {
        () = reader_loop(office, read_half) => {}
        () = writer_loop(office, write_half) => {}
        () = watchdog(office) => {}
        _ = shutdown.changed() => {}
    }
}

/// Drain the central-bound mailbox onto the socket, handshake first.
async fn writer_loop(office: &Arc<OfficeInner>, mut writer: OwnedWriteHalf) {
    let shared = &office.link;

    let handshake = build_handshake(office);
    let frame = match handshake.to_bytes().and_then(|bytes| encode_frame(&bytes)) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(error = %e, "cannot encode handshake");
            return;
        }
    };
    if writer.write_all(&frame).await.is_err() {
        return;
    }
    shared.ever_handshaken.store(true, Ordering::Release);

    // Retransmit the frame that was in flight when the last socket died;
    // it may have been partially written there, so the receiver's
    // de-framer resynchronizes on any duplicate prefix.
    let pending = lock(&shared.pending).clone();
    if let Some(frame) = pending {
        if writer.write_all(&frame).await.is_err() {
            return;
        }
        *lock(&shared.pending) = None;
    }

    loop {
        let Some(message) = office.central_out().take().await else {
            return;
        };
        let frame = match message.to_bytes().and_then(|bytes| encode_frame(&bytes)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = message.id(), error = %e, "dropping unencodable message");
                continue;
            }
        };
        *lock(&shared.pending) = Some(frame.clone());
        if writer.write_all(&frame).await.is_err() {
            return;
        }
        *lock(&shared.pending) = None;
    }
}

/// Deframe the socket and hand every message to routing.
async fn reader_loop(office: &Arc<OfficeInner>, mut reader: OwnedReadHalf) {
    let shared = &office.link;
    let mut deframer = Deframer::new(shared.max_message_size());
    let mut buf = vec![0u8; shared.max_message_size() + 10];

    loop {
        deframer.resize(shared.max_message_size());
        let wanted = shared.max_message_size() + 10;
        if buf.len() < wanted {
            buf.resize(wanted, 0);
        }

        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                deframer.push(&buf[..n]);
                let rejected_before = deframer.rejected_frames();
                while let Some(payload) = deframer.next_frame() {
                    match Message::from_slice(&payload) {
                        Ok(message) => office.route(message),
                        Err(e) => {
                            tracing::warn!(error = %e, "dropping malformed message");
                        }
                    }
                }
                let rejected = deframer.rejected_frames() - rejected_before;
                if rejected > 0 {
                    tracing::warn!(rejected, "dropped malformed frames");
                }
            }
        }
    }
}

/// Tear the session down when pings stop arriving.
async fn watchdog(office: &Arc<OfficeInner>) {
    let shared = &office.link;
    let mut tick = tokio::time::interval(PING_CHECK_INTERVAL);
    loop {
        tick.tick().await;
        let interval_ms = shared.announced_ping_ms.load(Ordering::Acquire);
        if interval_ms == 0 {
            continue;
        }
        let silence = shared.ping_silence_ms();
        if silence > interval_ms.saturating_mul(3) / 2 {
            tracing::warn!(
                silence_ms = silence,
                "no ping from central post office; dropping link"
            );
            return;
        }
    }
}

/// The first frame on every socket: `manage.connect` on the first socket
/// of this process, `manage.reconnect` afterwards, both carrying the
/// authenticator.
fn build_handshake(office: &Arc<OfficeInner>) -> Message {
    let first = !office.link.ever_handshaken.load(Ordering::Acquire);
    let msg_type = if first { message_types::CONNECT } else { message_types::RECONNECT };
    let id = office.next_wire_id();
    let mut handshake = Message::direct(
        office.management_address(),
        &Address::central_management(),
        msg_type,
        &id,
        true,
    );
    handshake
        .put_dotted(
            "authenticator",
            authenticator(office.secret(), office.name(), &id),
        )
        .ok();
    handshake
}
