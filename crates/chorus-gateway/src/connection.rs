//! Per-socket state and the outbound mailbox.
//!
//! Socket writes must not race and slow consumers must not stall
//! broadcast loops, so every connection gets a bounded mailbox drained
//! by a single writer task. Two message classes:
//!
//! - *droppable* (awareness) — on overflow the oldest droppable entry
//!   is evicted; awareness is idempotent-by-latest, losing one is fine.
//! - *guaranteed* (content, membership, termination, replies) — never
//!   evicted; if the mailbox is full of guaranteed frames the socket is
//!   declared dead and closed.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::sync::RwLock;

use chorus_core::{ClientId, Did, DocumentId, Role, SessionKey};

/// Bounded depth of one connection's outbound queue.
pub(crate) const MAILBOX_CAPACITY: usize = 256;

/// One outbound item.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A JSON text frame.
    Frame {
        payload: String,
        droppable: bool,
    },
    /// Reply to a Ping.
    Pong(Vec<u8>),
    /// Close the socket and end the writer task.
    Shutdown,
}

/// Result of a mailbox push.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Enqueued (possibly after evicting an older droppable frame).
    Queued,
    /// The frame was droppable and the queue had no room: dropped.
    Dropped,
    /// The queue is full of guaranteed frames: the socket is too slow
    /// to live.
    Overflow,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Outbound>,
    closed: bool,
}

/// Bounded outbound queue with class-aware eviction.
pub(crate) struct Mailbox {
    queue: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self::with_capacity(MAILBOX_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an item. Non-suspending.
    pub(crate) fn push(&self, item: Outbound) -> PushOutcome {
        let outcome = {
            let Ok(mut queue) = self.queue.lock() else {
                return PushOutcome::Overflow;
            };
            if queue.closed {
                return PushOutcome::Dropped;
            }
            if matches!(item, Outbound::Shutdown) {
                // Shutdown preempts everything still pending.
                queue.items.clear();
                queue.items.push_back(item);
                queue.closed = true;
                PushOutcome::Queued
            } else if queue.items.len() < self.capacity {
                queue.items.push_back(item);
                PushOutcome::Queued
            } else if let Some(victim) = queue
                .items
                .iter()
                .position(|i| matches!(i, Outbound::Frame { droppable: true, .. }))
            {
                // Full: evict the oldest droppable frame to make room.
                queue.items.remove(victim);
                queue.items.push_back(item);
                PushOutcome::Queued
            } else if matches!(item, Outbound::Frame { droppable: true, .. }) {
                PushOutcome::Dropped
            } else {
                PushOutcome::Overflow
            }
        };
        if outcome == PushOutcome::Queued {
            self.notify.notify_one();
        }
        outcome
    }

    /// Dequeue the next item, waiting if the queue is empty. Returns
    /// `None` after a `Shutdown` item has been consumed.
    pub(crate) async fn pop(&self) -> Option<Outbound> {
        loop {
            let notified = self.notify.notified();
            {
                let Ok(mut queue) = self.queue.lock() else {
                    return None;
                };
                if let Some(item) = queue.items.pop_front() {
                    if matches!(item, Outbound::Shutdown) {
                        return None;
                    }
                    return Some(item);
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Mutable per-connection state, written by `/auth` and disconnection.
#[derive(Debug, Default, Clone)]
pub(crate) struct ConnectionState {
    pub(crate) authenticated: bool,
    pub(crate) document_id: Option<DocumentId>,
    pub(crate) session_did: Option<Did>,
    pub(crate) role: Option<Role>,
}

impl ConnectionState {
    /// The session key this connection authenticated into, if any.
    pub(crate) fn session_key(&self) -> Option<SessionKey> {
        match (&self.document_id, &self.session_did) {
            (Some(doc), Some(did)) => Some(SessionKey::new(doc.clone(), did.clone())),
            _ => None,
        }
    }
}

/// One accepted socket.
pub(crate) struct Connection {
    pub(crate) client_id: ClientId,
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) mailbox: Mailbox,
}

impl Connection {
    pub(crate) fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            state: RwLock::new(ConnectionState::default()),
            mailbox: Mailbox::new(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
