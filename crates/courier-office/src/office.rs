//! The post office runtime: mailbox registry, routing, subscriptions.
//!
//! One `PostOffice` per process. It owns the mailbox registry, the
//! subscription index, the monotonic id counter, and the background tasks:
//! the central link, the management mailbox handler, and the subscription
//! retry timer. Actors interact only through [`Mailbox`] handles.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use courier_proto::{
    Address, CENTRAL_OUT_MAILBOX, MANAGEMENT_MAILBOX, Message, SubscriptionIndex, message_types,
    radix64,
};
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::OfficeConfig,
    error::OfficeError,
    link::{self, LinkShared},
    mailbox::{Mailbox, MailboxCore},
};

/// How often the subscription retry timer runs.
const WAITER_TICK: Duration = Duration::from_millis(100);

/// Age at which an unacknowledged subscription request is retransmitted.
const WAITER_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Lock a mutex, ignoring poisoning: worker loops never leave shared state
/// in a half-mutated critical section.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An unacknowledged `manage.subscribe` / `manage.unsubscribe`, keyed by
/// message id and retransmitted until any reply names it.
struct SpecialWaiter {
    message: Message,
    sent_at: Instant,
}

/// Shared state behind every [`Mailbox`] handle.
pub(crate) struct OfficeInner {
    name: String,
    secret: Vec<u8>,
    queue_size: usize,
    cpo_host: String,
    cpo_port: u16,
    management_address: Address,
    mailboxes: RwLock<HashMap<String, Arc<MailboxCore>>>,
    subscriptions: Mutex<SubscriptionIndex>,
    special_waiters: Mutex<HashMap<String, SpecialWaiter>>,
    next_id: AtomicU64,
    central_out: Arc<MailboxCore>,
    management: Arc<MailboxCore>,
    pub(crate) link: LinkShared,
}

impl OfficeInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub(crate) fn cpo_endpoint(&self) -> (&str, u16) {
        (&self.cpo_host, self.cpo_port)
    }

    pub(crate) fn management_address(&self) -> &Address {
        &self.management_address
    }

    pub(crate) fn central_out(&self) -> &Arc<MailboxCore> {
        &self.central_out
    }

    /// Next wire id: `<counter in radix64>.<poName>`, unique across the
    /// fabric because the name is unique at the central post office.
    pub(crate) fn next_wire_id(&self) -> String {
        let counter = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{}", radix64::encode(counter), self.name)
    }

    /// Route one message: local delivery, central forwarding, or publish
    /// fan-out. Undeliverable messages are logged and dropped.
    pub(crate) fn route(&self, message: Message) {
        let Some(to) = message.to_addr() else {
            self.route_publish(&message);
            return;
        };
        let Ok(to) = to.parse::<Address>() else {
            tracing::warn!(to, "dropping message with unparseable recipient");
            return;
        };

        if to.po() == self.name {
            // An incoming reply that names a pending subscription request
            // is its acknowledgement; consume it.
            if let Some(reply_id) = message.in_reply_to() {
                if lock(&self.special_waiters).remove(reply_id).is_some() {
                    tracing::debug!(reply = reply_id, "subscription request acknowledged");
                    return;
                }
            }
            let core = self.lookup(to.mailbox());
            match core {
                Some(core) => core.receive(message),
                None => tracing::warn!(
                    to = %to,
                    "dropping message for unknown local mailbox"
                ),
            }
            return;
        }

        // Foreign: track subscription requests so they retry until the
        // source post office acknowledges them.
        if to.is_management()
            && matches!(
                message.type_name(),
                message_types::SUBSCRIBE | message_types::UNSUBSCRIBE
            )
            && message.in_reply_to().is_none()
            && message.expects_reply()
        {
            lock(&self.special_waiters).insert(
                message.id().to_string(),
                SpecialWaiter { message: message.clone(), sent_at: Instant::now() },
            );
        }
        self.central_out.receive(message);
    }

    fn route_publish(&self, message: &Message) {
        let subscribers = lock(&self.subscriptions)
            .subscribers_for_publish(message.from_addr(), message.type_name());
        if subscribers.is_empty() {
            tracing::debug!(
                from = message.from_addr(),
                msg_type = message.type_name(),
                "publish with no subscribers"
            );
            return;
        }
        for subscriber in subscribers {
            if subscriber.po() == self.name {
                match self.lookup(subscriber.mailbox()) {
                    Some(core) => core.receive(message.clone()),
                    None => tracing::warn!(
                        subscriber = %subscriber,
                        "dropping publish for vanished subscriber mailbox"
                    ),
                }
            } else {
                // Subscribers on other post offices are represented by the
                // central-bound proxy, so this arm should not be reached.
                self.central_out.receive(message.clone());
            }
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<MailboxCore>> {
        self.mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Apply a local subscription change and, for foreign sources, notify
    /// the source post office through the central link.
    pub(crate) fn manage_subscription(
        &self,
        add: bool,
        subscriber: &Address,
        source: &Address,
        msg_type: &str,
    ) {
        let key = SubscriptionIndex::key(source, msg_type);
        {
            let mut subs = lock(&self.subscriptions);
            if add {
                subs.subscribe(&key, subscriber.clone());
            } else {
                subs.unsubscribe(&key, subscriber);
            }
        }
        if source.po() == self.name {
            return;
        }
        let Ok(to) = Address::management(source.po()) else {
            return;
        };
        let msg_type_name =
            if add { message_types::SUBSCRIBE } else { message_types::UNSUBSCRIBE };
        let mut request =
            Message::direct(subscriber, &to, msg_type_name, &self.next_wire_id(), true);
        request.put_dotted("source", source.to_string()).ok();
        request.put_dotted("type", msg_type).ok();
        request.put_dotted("requestor", subscriber.to_string()).ok();
        self.route(request);
    }

    /// Re-issue `manage.subscribe` for every foreign subscription. Runs
    /// once, after the first successful central handshake; these replays
    /// are informational and do not expect replies.
    pub(crate) fn refresh_foreign_subscriptions(&self) {
        let snapshot: Vec<(String, Vec<Address>)> = lock(&self.subscriptions)
            .entries()
            .map(|(key, set)| (key.to_string(), set.iter().cloned().collect()))
            .collect();

        for (key, subscribers) in snapshot {
            let Some((source, msg_type)) = SubscriptionIndex::split_key(&key) else {
                continue;
            };
            if source.po() == self.name {
                continue;
            }
            let Ok(to) = Address::management(source.po()) else {
                continue;
            };
            for subscriber in subscribers {
                let mut request = Message::direct(
                    &subscriber,
                    &to,
                    message_types::SUBSCRIBE,
                    &self.next_wire_id(),
                    false,
                );
                request.put_dotted("source", source.to_string()).ok();
                request.put_dotted("type", msg_type.clone()).ok();
                request.put_dotted("requestor", subscriber.to_string()).ok();
                self.route(request);
            }
        }
    }

    /// Handle one message delivered to the reserved `po` mailbox.
    fn handle_management(&self, message: Message) {
        match message.type_name() {
            message_types::PING => {
                self.link.note_ping();
                let id = self.next_wire_id();
                match Message::reply(&message, &self.management_address, message_types::PONG, &id)
                {
                    Ok(pong) => self.route(pong),
                    Err(e) => tracing::warn!(error = %e, "cannot build pong"),
                }
            }
            message_types::CONNECT | message_types::RECONNECT
                if message.in_reply_to().is_some() =>
            {
                let max = message.get_dotted("maxMessageSize").and_then(Value::as_u64);
                let ping = message.get_dotted("pingIntervalMS").and_then(Value::as_u64);
                let first = self.link.handshake_complete(max, ping);
                tracing::info!(
                    max_message_size = max,
                    ping_interval_ms = ping,
                    "central post office accepted the link"
                );
                if first {
                    self.refresh_foreign_subscriptions();
                }
            }
            message_types::SUBSCRIBE | message_types::UNSUBSCRIBE => {
                if message.in_reply_to().is_none() {
                    self.handle_remote_subscription(&message);
                }
            }
            other => {
                tracing::debug!(msg_type = other, "ignoring management message");
            }
        }
    }

    /// A foreign post office (un)subscribes to one of our sources; mirror
    /// the change locally, proxying foreign requestors through the
    /// central-bound mailbox.
    fn handle_remote_subscription(&self, message: &Message) {
        let add = message.type_name() == message_types::SUBSCRIBE;
        let (Some(source), Some(msg_type), Some(requestor)) = (
            message.get_str("source"),
            message.get_str("type"),
            message.get_str("requestor"),
        ) else {
            tracing::warn!("dropping subscription request with missing fields");
            return;
        };
        let (Ok(source), Ok(requestor)) =
            (source.parse::<Address>(), requestor.parse::<Address>())
        else {
            tracing::warn!("dropping subscription request with invalid addresses");
            return;
        };

        let subscriber = if requestor.po() == self.name {
            requestor
        } else {
            self.central_out.address().clone()
        };

        let key = SubscriptionIndex::key(&source, msg_type);
        {
            let mut subs = lock(&self.subscriptions);
            if add {
                subs.subscribe(&key, subscriber);
            } else {
                subs.unsubscribe(&key, &subscriber);
            }
        }
        tracing::debug!(key = %key, add, "remote subscription change applied");

        if message.expects_reply() {
            let id = self.next_wire_id();
            match Message::reply(message, &self.management_address, message.type_name(), &id) {
                Ok(ack) => self.route(ack),
                Err(e) => tracing::warn!(error = %e, "cannot build subscription ack"),
            }
        }
    }

    /// Retransmit unacknowledged subscription requests older than the
    /// retry threshold.
    fn retry_special_waiters(&self) {
        let mut resend = Vec::new();
        {
            let mut waiters = lock(&self.special_waiters);
            for waiter in waiters.values_mut() {
                if waiter.sent_at.elapsed() >= WAITER_RETRY_AFTER {
                    waiter.sent_at = Instant::now();
                    resend.push(waiter.message.clone());
                }
            }
        }
        for message in resend {
            tracing::debug!(id = message.id(), "retransmitting subscription request");
            self.central_out.receive(message);
        }
    }

    fn close_all_mailboxes(&self) {
        let map = self.mailboxes.read().unwrap_or_else(PoisonError::into_inner);
        for core in map.values() {
            core.close();
        }
    }
}

/// A running post office.
///
/// Dropping the handle does not stop the background tasks; call
/// [`PostOffice::shutdown`] for an orderly exit.
pub struct PostOffice {
    inner: Arc<OfficeInner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PostOffice {
    /// Validate the configuration and start the runtime.
    ///
    /// The central link connects in the background and reconnects on its
    /// own; mailboxes are usable immediately for local traffic.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(config: OfficeConfig) -> Result<Self, OfficeError> {
        config.validate()?;
        let secret = config.secret_bytes()?;

        let management_address = Address::management(&config.name)?;
        let central_out_address = Address::new(&config.name, CENTRAL_OUT_MAILBOX)?;
        let management = Arc::new(MailboxCore::new(management_address.clone(), config.queue_size));
        let central_out =
            Arc::new(MailboxCore::new(central_out_address, config.queue_size));

        let mut mailboxes = HashMap::new();
        mailboxes.insert(MANAGEMENT_MAILBOX.to_string(), Arc::clone(&management));
        mailboxes.insert(CENTRAL_OUT_MAILBOX.to_string(), Arc::clone(&central_out));

        let inner = Arc::new(OfficeInner {
            name: config.name.clone(),
            secret,
            queue_size: config.queue_size,
            cpo_host: config.cpo_host.clone(),
            cpo_port: config.cpo_port,
            management_address,
            mailboxes: RwLock::new(mailboxes),
            subscriptions: Mutex::new(SubscriptionIndex::new()),
            special_waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            central_out,
            management,
            link: LinkShared::new(config.max_message_size),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(link::run(Arc::clone(&inner), shutdown_rx.clone())));
        tasks.push(tokio::spawn(run_management(Arc::clone(&inner))));
        tasks.push(tokio::spawn(run_waiter_timer(Arc::clone(&inner), shutdown_rx)));

        tracing::info!(name = %config.name, "post office started");
        Ok(Self { inner, shutdown, tasks: Mutex::new(tasks) })
    }

    /// This post office's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the central link is currently established and handshaken.
    pub fn is_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    /// Create a mailbox. Names must be unique within the post office,
    /// non-empty, dot-free, and not reserved.
    pub fn create_mailbox(&self, name: &str) -> Result<Mailbox, OfficeError> {
        if name == MANAGEMENT_MAILBOX || name == CENTRAL_OUT_MAILBOX {
            return Err(OfficeError::ReservedMailbox { name: name.to_string() });
        }
        let address = Address::new(&self.inner.name, name)?;

        let mut map = self.inner.mailboxes.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(name) {
            return Err(OfficeError::DuplicateMailbox { name: name.to_string() });
        }
        let core = Arc::new(MailboxCore::new(address, self.inner.queue_size));
        map.insert(name.to_string(), Arc::clone(&core));
        drop(map);

        Ok(Mailbox { core, office: Arc::clone(&self.inner) })
    }

    /// Stop the background tasks and close every mailbox.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.inner.close_all_mailboxes();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.tasks));
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(name = %self.inner.name, "post office stopped");
    }
}

/// Consume the reserved `po` mailbox.
async fn run_management(inner: Arc<OfficeInner>) {
    while let Some(message) = inner.management.take().await {
        inner.handle_management(message);
    }
}

/// Drive the subscription retry timer.
async fn run_waiter_timer(inner: Arc<OfficeInner>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(WAITER_TICK);
    loop {
        tokio::select! {
            _ = tick.tick() => inner.retry_special_waiters(),
            _ = shutdown.changed() => return,
        }
    }
}
