//! The broker runtime: sockets, tasks, and action execution.
//!
//! [`Central`] wraps the pure [`Router`](crate::router::Router) with real
//! I/O. One loop owns the router and all connection bookkeeping: it
//! accepts connections, drains the bounded receive channel that the
//! per-connection reader tasks feed, and executes the router's actions.
//! Per-client writer tasks drain the outbound queues, which survive
//! reconnects. Every per-iteration failure is logged and swallowed; only
//! binding errors are fatal.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use courier_proto::{Message, encode_frame};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::AbortHandle,
};

use crate::{
    client::{OUT_QUEUE_DEPTH, OutQueue},
    config::{CentralConfig, ConfigStore, OverflowPolicy},
    error::CentralError,
    monitor::{Telemetry, TelemetryProbe},
    router::{Router, RouterAction, RouterEvent},
};

/// Depth of the inbound bytes channel between readers and the router.
const RX_QUEUE_DEPTH: usize = 100;

/// How often silent connections are checked for.
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);

/// A bound, not-yet-running central post office.
pub struct Central {
    config: CentralConfig,
    listener: TcpListener,
    router: Router,
    probe: Arc<dyn TelemetryProbe>,
}

impl Central {
    /// Validate the configuration and bind the listening socket.
    pub async fn bind(
        config: CentralConfig,
        store: Arc<dyn ConfigStore>,
        probe: Arc<dyn TelemetryProbe>,
    ) -> Result<Self, CentralError> {
        config.validate()?;
        let listener =
            TcpListener::bind((config.local_address.as_str(), config.port)).await?;
        let router = Router::new(config.clone(), store)?;
        tracing::info!(
            address = %listener.local_addr()?,
            clients = config.clients.len(),
            "central post office bound"
        );
        Ok(Self { config, listener, router, probe })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, CentralError> {
        self.listener.local_addr().map_err(CentralError::Io)
    }

    /// Serve until the task is cancelled.
    pub async fn run(mut self) -> Result<(), CentralError> {
        let (events_tx, mut events_rx) = mpsc::channel::<RouterEvent>(RX_QUEUE_DEPTH);
        let mut executor = Executor {
            overflow: self.config.overflow,
            probe: Arc::clone(&self.probe),
            events_tx: events_tx.clone(),
            conns: HashMap::new(),
            out_queues: HashMap::new(),
        };

        let mut ping =
            tokio::time::interval(Duration::from_millis(self.config.ping_interval_ms));
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let conn_id = remote.to_string();
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(error = %e, "cannot set TCP_NODELAY");
                        }
                        let (read_half, write_half) = stream.into_split();
                        let reader = tokio::spawn(reader_task(
                            conn_id.clone(),
                            read_half,
                            events_tx.clone(),
                            self.config.max_message_size,
                        ));
                        executor.register(conn_id.clone(), write_half, reader.abort_handle());
                        let actions = self.router.handle(RouterEvent::Accepted { conn_id });
                        executor.execute(actions);
                    }
                    Err(e) => tracing::error!(error = %e, "accept failed"),
                },
                Some(event) = events_rx.recv() => {
                    let actions = self.router.handle(event);
                    executor.execute(actions);
                }
                _ = ping.tick() => {
                    let actions = self.router.handle(RouterEvent::PingTick);
                    executor.execute(actions);
                }
                _ = watchdog.tick() => {
                    let actions = self.router.handle(RouterEvent::WatchdogTick);
                    executor.execute(actions);
                }
            }
        }
    }
}

struct ConnIo {
    /// Parked until the connection authenticates and a writer is spawned.
    write_half: Option<OwnedWriteHalf>,
    reader: AbortHandle,
    writer: Option<AbortHandle>,
}

/// Executes router actions against the real sockets and tasks.
struct Executor {
    overflow: OverflowPolicy,
    probe: Arc<dyn TelemetryProbe>,
    events_tx: mpsc::Sender<RouterEvent>,
    conns: HashMap<String, ConnIo>,
    out_queues: HashMap<String, Arc<OutQueue>>,
}

impl Executor {
    fn register(&mut self, conn_id: String, write_half: OwnedWriteHalf, reader: AbortHandle) {
        self.conns
            .insert(conn_id, ConnIo { write_half: Some(write_half), reader, writer: None });
    }

    /// The client's outbound queue; created on first use and kept across
    /// reconnects.
    fn queue_for(&mut self, client: &str) -> Arc<OutQueue> {
        Arc::clone(
            self.out_queues
                .entry(client.to_string())
                .or_insert_with(|| Arc::new(OutQueue::new(OUT_QUEUE_DEPTH, self.overflow))),
        )
    }

    fn execute(&mut self, actions: Vec<RouterAction>) {
        for action in actions {
            match action {
                RouterAction::Associate { conn_id, client } => {
                    let queue = self.queue_for(&client);
                    // A frame the previous writer died on goes out first.
                    queue.requeue_current();
                    if let Some(conn) = self.conns.get_mut(&conn_id) {
                        if let Some(write_half) = conn.write_half.take() {
                            let writer = tokio::spawn(writer_task(
                                conn_id.clone(),
                                write_half,
                                queue,
                                self.events_tx.clone(),
                            ));
                            conn.writer = Some(writer.abort_handle());
                        }
                    }
                }
                RouterAction::Enqueue { client, frame } => {
                    let queue = self.queue_for(&client);
                    if !queue.enqueue(frame) {
                        tracing::warn!(client = %client, "outbound queue full; dropping frame");
                    }
                }
                RouterAction::Close { conn_id } => {
                    if let Some(conn) = self.conns.remove(&conn_id) {
                        conn.reader.abort();
                        if let Some(writer) = conn.writer {
                            writer.abort();
                        }
                    }
                }
                RouterAction::Monitor { client, reply } => {
                    let queue = self.queue_for(&client);
                    let probe = Arc::clone(&self.probe);
                    tokio::spawn(async move {
                        let sample = tokio::task::spawn_blocking(move || probe.collect())
                            .await
                            .unwrap_or_else(|e| {
                                Telemetry::invalid(format!("collection task failed: {e}"))
                            });
                        let mut reply = reply;
                        fill_monitor_reply(&mut reply, &sample);
                        match reply.to_bytes().and_then(|bytes| encode_frame(&bytes)) {
                            Ok(frame) => {
                                if !queue.enqueue(bytes::Bytes::from(frame)) {
                                    tracing::warn!(client = %client, "outbound queue full; dropping monitor reply");
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "cannot encode monitor reply");
                            }
                        }
                    });
                }
                RouterAction::DropClient { client } => {
                    self.out_queues.remove(&client);
                }
            }
        }
    }
}

fn fill_monitor_reply(reply: &mut Message, sample: &Telemetry) {
    if let Ok(os) = serde_json::to_value(&sample.os) {
        reply.put_dotted("monitor.os", os).ok();
    }
    if let Ok(process) = serde_json::to_value(&sample.process) {
        reply.put_dotted("monitor.process", process).ok();
    }
}

/// Read raw bytes into the router's bounded channel; the channel is the
/// back-pressure, readers block when the router falls behind.
async fn reader_task(
    conn_id: String,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<RouterEvent>,
    max_message_size: usize,
) {
    loop {
        let mut buf = vec![0u8; max_message_size + 10];
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events.send(RouterEvent::Closed { conn_id }).await;
                return;
            }
            Ok(n) => {
                buf.truncate(n);
                if events
                    .send(RouterEvent::Data { conn_id: conn_id.clone(), bytes: buf })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Drain one client's outbound queue onto one connection. A failed write
/// puts the frame back at the head for the next connection.
async fn writer_task(
    conn_id: String,
    mut writer: OwnedWriteHalf,
    queue: Arc<OutQueue>,
    events: mpsc::Sender<RouterEvent>,
) {
    loop {
        let frame = queue.next().await;
        if writer.write_all(&frame).await.is_err() {
            queue.requeue_current();
            let _ = events.send(RouterEvent::Closed { conn_id }).await;
            return;
        }
        queue.complete_current();
    }
}
