// Per-connection state: subscription filters, the bounded send queue
// (drop-oldest on overflow), the per-topic delivery guard that keeps
// sequences strictly increasing across replay and live phases, and heartbeat
// bookkeeping.

use super::protocol::WsEnvelope;
use crate::types::{Event, EventType};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::Notify;

/// Bounded outbound queue. When full, the oldest frame is dropped and the
/// drop counter increments; the producer never blocks.
pub struct SendQueue {
    inner: Mutex<VecDeque<WsEnvelope>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        SendQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, envelope: WsEnvelope) {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(envelope);
        drop(queue);
        self.notify.notify_one();
    }

    /// Await the next frame.
    pub async fn pop(&self) -> WsEnvelope {
        loop {
            if let Some(envelope) = self.inner.lock().pop_front() {
                return envelope;
            }
            self.notify.notified().await;
        }
    }

    /// Drain whatever is queued right now (used by the close path).
    pub fn drain(&self) -> Vec<WsEnvelope> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Filters {
    repositories: HashSet<String>,
    event_types: HashSet<EventType>,
}

pub struct Connection {
    pub id: String,
    pub authenticated: AtomicBool,
    client_id: Mutex<Option<String>>,
    filters: Mutex<Filters>,
    /// Per-topic highest sequence handed to this connection. The guard makes
    /// replay-then-live delivery exactly-once and strictly increasing.
    last_sent: Mutex<HashMap<String, u64>>,
    /// Live events arriving while a replay is in flight buffer here.
    replay_buffer: Mutex<Option<Vec<Event>>>,
    pub last_pong: Mutex<Instant>,
    queue: SendQueue,
}

impl Connection {
    pub fn new(id: String, queue_capacity: usize) -> Self {
        Connection {
            id,
            authenticated: AtomicBool::new(false),
            client_id: Mutex::new(None),
            filters: Mutex::new(Filters {
                repositories: HashSet::new(),
                event_types: HashSet::new(),
            }),
            last_sent: Mutex::new(HashMap::new()),
            replay_buffer: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
            queue: SendQueue::new(queue_capacity),
        }
    }

    pub fn queue(&self) -> &SendQueue {
        &self.queue
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    pub fn set_client_id(&self, client_id: Option<String>) {
        *self.client_id.lock() = client_id;
    }

    pub fn set_filters(&self, repositories: Vec<String>, event_types: Vec<EventType>) {
        let mut filters = self.filters.lock();
        filters.repositories = repositories.into_iter().collect();
        filters.event_types = event_types.into_iter().collect();
    }

    /// Whether the connection's subscription matches an event. Empty sets
    /// match everything; repository-less events are global.
    pub fn matches(&self, event: &Event) -> bool {
        let filters = self.filters.lock();
        if !filters.event_types.is_empty() && !filters.event_types.contains(&event.event_type) {
            return false;
        }
        if !filters.repositories.is_empty() {
            match &event.repository {
                Some(repo) if filters.repositories.contains(repo) => {}
                None => {}
                Some(_) => return false,
            }
        }
        true
    }

    /// Seed the per-topic cursor from the client's `last_sequence` so replay
    /// starts exactly after it.
    pub fn seed_cursor(&self, topic: &str, sequence: u64) {
        self.last_sent.lock().insert(topic.to_string(), sequence);
    }

    /// Buffer live events until the replay finishes.
    pub fn begin_replay(&self) {
        *self.replay_buffer.lock() = Some(Vec::new());
    }

    /// Flush buffered live events through the sequence guard.
    pub fn finish_replay(&self) {
        let buffered = self.replay_buffer.lock().take().unwrap_or_default();
        for event in buffered {
            self.deliver(&event);
        }
    }

    /// Hand an event to this connection. Returns true when the event was
    /// enqueued (not deduplicated or buffered).
    pub fn offer(&self, event: &Event) -> bool {
        {
            let mut buffer = self.replay_buffer.lock();
            if let Some(pending) = buffer.as_mut() {
                pending.push(event.clone());
                return false;
            }
        }
        self.deliver(event)
    }

    pub(super) fn deliver(&self, event: &Event) -> bool {
        // Out-of-band frames (sequence 0, e.g. overflow notices) bypass the
        // guard
        if event.sequence > 0 {
            let mut last_sent = self.last_sent.lock();
            let cursor = last_sent.entry(event.topic.clone()).or_insert(0);
            if event.sequence <= *cursor {
                return false;
            }
            *cursor = event.sequence;
        }
        self.queue.push(WsEnvelope::event(event));
        true
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn pong_age(&self) -> std::time::Duration {
        self.last_pong.lock().elapsed()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
