//! Mailboxes: bounded receive queues with reply rendezvous.
//!
//! A mailbox is the unit of addressing. Deliveries that answer an
//! outstanding `send_and_wait` are handed straight to the waiter and never
//! enter the queue; everything else is enqueued FIFO, and an arriving
//! message is dropped (with a log line) when the queue is full.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use courier_proto::{Address, Message};
use tokio::sync::{Notify, oneshot};

use crate::office::{OfficeInner, lock};

/// A reply rendezvous slot.
///
/// The slot stays registered after resolution so that duplicate replies for
/// the same id are discarded instead of leaking into the queue; the waiter
/// removes the entry when it returns.
enum WaiterSlot {
    Waiting(oneshot::Sender<Message>),
    Resolved,
}

struct QueueState {
    queue: VecDeque<Message>,
    closed: bool,
}

/// Shared mailbox state, owned by the post office registry.
pub(crate) struct MailboxCore {
    name: String,
    address: Address,
    capacity: usize,
    state: std::sync::Mutex<QueueState>,
    notify: Notify,
    waiters: std::sync::Mutex<HashMap<String, WaiterSlot>>,
}

impl MailboxCore {
    pub(crate) fn new(address: Address, capacity: usize) -> Self {
        Self {
            name: address.mailbox().to_string(),
            address,
            capacity,
            state: std::sync::Mutex::new(QueueState { queue: VecDeque::new(), closed: false }),
            notify: Notify::new(),
            waiters: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    /// Deliver one message: rendezvous with a reply waiter if one matches,
    /// otherwise enqueue.
    pub(crate) fn receive(&self, message: Message) {
        let reply_id = message.in_reply_to().map(str::to_string);
        if let Some(reply_id) = reply_id {
            let mut waiters = lock(&self.waiters);
            if let Some(slot) = waiters.get_mut(&reply_id) {
                match std::mem::replace(slot, WaiterSlot::Resolved) {
                    WaiterSlot::Waiting(tx) => {
                        if let Err(unclaimed) = tx.send(message) {
                            // The waiter gave up just before delivery;
                            // late replies fall through to the queue.
                            waiters.remove(&reply_id);
                            drop(waiters);
                            self.enqueue(unclaimed);
                        }
                    }
                    WaiterSlot::Resolved => {
                        tracing::debug!(
                            mailbox = %self.address,
                            reply = %reply_id,
                            "discarding extra reply"
                        );
                    }
                }
                return;
            }
        }
        self.enqueue(message);
    }

    fn enqueue(&self, message: Message) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            if state.queue.len() >= self.capacity {
                tracing::warn!(
                    mailbox = %self.address,
                    capacity = self.capacity,
                    "receive queue full; dropping arriving message"
                );
                return;
            }
            state.queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Dequeue, waiting as long as it takes. `None` after shutdown.
    pub(crate) async fn take(&self) -> Option<Message> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = lock(&self.state);
                if let Some(m) = state.queue.pop_front() {
                    return Some(m);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn register_waiter(&self, id: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(id.to_string(), WaiterSlot::Waiting(tx));
        rx
    }

    pub(crate) fn remove_waiter(&self, id: &str) {
        lock(&self.waiters).remove(id);
    }

    pub(crate) fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_waiters();
        lock(&self.waiters).clear();
    }
}

/// An actor's handle to one mailbox.
///
/// Handles are cheap to clone; the underlying mailbox lives until the post
/// office shuts down.
#[derive(Clone)]
pub struct Mailbox {
    pub(crate) core: Arc<MailboxCore>,
    pub(crate) office: Arc<OfficeInner>,
}

impl Mailbox {
    /// Short mailbox name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Fully-qualified address.
    pub fn address(&self) -> &Address {
        &self.core.address
    }

    /// Build a direct message from this mailbox with a fresh id.
    pub fn create_direct(&self, to: &Address, msg_type: &str, expect_reply: bool) -> Message {
        Message::direct(&self.core.address, to, msg_type, &self.office.next_wire_id(), expect_reply)
    }

    /// Build a reply to `original` from this mailbox with a fresh id.
    pub fn create_reply(
        &self,
        original: &Message,
        msg_type: &str,
    ) -> Result<Message, courier_proto::ProtocolError> {
        Message::reply(original, &self.core.address, msg_type, &self.office.next_wire_id())
    }

    /// Build a publish message from this mailbox with a fresh id.
    pub fn create_publish(&self, msg_type: &str) -> Message {
        Message::publish(&self.core.address, msg_type, &self.office.next_wire_id())
    }

    /// Hand a message to routing. Non-blocking; there is no delivery
    /// acknowledgement.
    pub fn send(&self, message: Message) {
        self.office.route(message);
    }

    /// Send and wait up to `deadline` for a reply to this message's id.
    ///
    /// Returns `None` on expiry. At most one waiter exists per id; replies
    /// arriving after expiry fall through to the regular queue.
    pub async fn send_and_wait(&self, message: Message, deadline: Duration) -> Option<Message> {
        let id = message.id().to_string();
        let rx = self.core.register_waiter(&id);
        self.office.route(message);
        let reply = tokio::time::timeout(deadline, rx).await.ok().and_then(Result::ok);
        self.core.remove_waiter(&id);
        reply
    }

    /// Blocking dequeue. Returns `None` once the post office shuts down.
    pub async fn take(&self) -> Option<Message> {
        self.core.take().await
    }

    /// Time-bounded dequeue. Returns `None` on timeout or shutdown.
    pub async fn poll(&self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.core.take()).await.ok().flatten()
    }

    /// Subscribe this mailbox to publishes from `source` with the given
    /// type. Idempotent; foreign sources are notified through the central
    /// post office and the request retries until acknowledged.
    pub fn subscribe(&self, source: &Address, msg_type: &str) {
        self.office.manage_subscription(true, &self.core.address, source, msg_type);
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, source: &Address, msg_type: &str) {
        self.office.manage_subscription(false, &self.core.address, source, msg_type);
    }
}
