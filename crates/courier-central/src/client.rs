//! Per-client broker state.
//!
//! A `PoClient` exists for every configured post office and survives
//! across reconnects; only the connection reference changes. Its outbound
//! queue holds serialized frames, bounded, with a configurable overflow
//! policy, and remembers the frame currently being written so a writer
//! that dies mid-frame can hand it to the next connection intact.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::{config::OverflowPolicy, lock};

/// Outbound queue capacity per client, in frames.
pub(crate) const OUT_QUEUE_DEPTH: usize = 100;

/// Broker-side state for one configured post office.
#[derive(Debug)]
pub(crate) struct PoClient {
    pub(crate) name: String,
    pub(crate) secret: Vec<u8>,
    pub(crate) manager: bool,
    /// Id of the current connection, if any.
    pub(crate) connection: Option<String>,
    pub(crate) rx_bytes: u64,
    pub(crate) tx_bytes: u64,
    pub(crate) rx_messages: u64,
    pub(crate) tx_messages: u64,
    pub(crate) connect_count: u64,
    pub(crate) last_connect_ms: Option<u64>,
}

impl PoClient {
    pub(crate) fn new(name: String, secret: Vec<u8>, manager: bool) -> Self {
        Self {
            name,
            secret,
            manager,
            connection: None,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_messages: 0,
            tx_messages: 0,
            connect_count: 0,
            last_connect_ms: None,
        }
    }

    /// Record a successful authentication on `conn_id`.
    pub(crate) fn connected(&mut self, conn_id: String) {
        self.connection = Some(conn_id);
        self.connect_count += 1;
        self.last_connect_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as u64);
    }
}

struct OutState {
    queue: VecDeque<Bytes>,
    /// The frame handed to a writer but not yet confirmed written.
    current: Option<Bytes>,
}

/// Bounded queue of serialized frames bound for one client.
///
/// Shared between the broker loop (producer) and the client's writer task
/// (consumer); it outlives any individual connection.
pub(crate) struct OutQueue {
    state: Mutex<OutState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutQueue {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(OutState { queue: VecDeque::new(), current: None }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    /// Enqueue a frame. Returns `false` when the frame was dropped by the
    /// overflow policy.
    pub(crate) fn enqueue(&self, frame: Bytes) -> bool {
        {
            let mut state = lock(&self.state);
            if state.queue.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropNewest => return false,
                    OverflowPolicy::DropOldest => {
                        state.queue.pop_front();
                    }
                }
            }
            state.queue.push_back(frame);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue the next frame, waiting as long as it takes. The frame is
    /// remembered as in-flight until [`OutQueue::complete_current`].
    pub(crate) async fn next(&self) -> Bytes {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = lock(&self.state);
                if let Some(frame) = state.queue.pop_front() {
                    state.current = Some(frame.clone());
                    return frame;
                }
            }
            notified.await;
        }
    }

    /// The in-flight frame was fully written.
    pub(crate) fn complete_current(&self) {
        lock(&self.state).current = None;
    }

    /// Put the in-flight frame back at the head of the queue, for the next
    /// connection to send first.
    pub(crate) fn requeue_current(&self) {
        let mut state = lock(&self.state);
        if let Some(frame) = state.current.take() {
            state.queue.push_front(frame);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Number of queued frames (excluding any in-flight one).
    pub(crate) fn depth(&self) -> usize {
        lock(&self.state).queue.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn fifo_order() {
        let q = OutQueue::new(10, OverflowPolicy::DropNewest);
        assert!(q.enqueue(Bytes::from_static(b"one")));
        assert!(q.enqueue(Bytes::from_static(b"two")));

        assert_eq!(q.next().await.as_ref(), b"one");
        q.complete_current();
        assert_eq!(q.next().await.as_ref(), b"two");
        q.complete_current();
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test]
    async fn drop_newest_rejects_overflow() {
        let q = OutQueue::new(2, OverflowPolicy::DropNewest);
        assert!(q.enqueue(Bytes::from_static(b"one")));
        assert!(q.enqueue(Bytes::from_static(b"two")));
        assert!(!q.enqueue(Bytes::from_static(b"three")));

        assert_eq!(q.next().await.as_ref(), b"one");
    }

    #[tokio::test]
    async fn drop_oldest_evicts_head() {
        let q = OutQueue::new(2, OverflowPolicy::DropOldest);
        assert!(q.enqueue(Bytes::from_static(b"one")));
        assert!(q.enqueue(Bytes::from_static(b"two")));
        assert!(q.enqueue(Bytes::from_static(b"three")));

        assert_eq!(q.next().await.as_ref(), b"two");
        q.complete_current();
        assert_eq!(q.next().await.as_ref(), b"three");
    }

    #[tokio::test]
    async fn requeue_puts_in_flight_frame_first() {
        let q = OutQueue::new(10, OverflowPolicy::DropNewest);
        q.enqueue(Bytes::from_static(b"one"));
        q.enqueue(Bytes::from_static(b"two"));

        assert_eq!(q.next().await.as_ref(), b"one");
        // The writer died mid-frame; the next connection must resend it.
        q.requeue_current();
        assert_eq!(q.next().await.as_ref(), b"one");
        q.complete_current();
        assert_eq!(q.next().await.as_ref(), b"two");
    }

    #[tokio::test]
    async fn next_wakes_on_enqueue() {
        let q = Arc::new(OutQueue::new(10, OverflowPolicy::DropNewest));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.enqueue(Bytes::from_static(b"late"));
        assert_eq!(waiter.await.unwrap().as_ref(), b"late");
    }
}
