// ── Memoro Core: Event Bus ─────────────────────────────────────────────────
// In-process pub/sub with per-topic monotonic sequences, optional
// persistence for replay, filtered subscriptions, and lag handling.
//
// Producers never block: a subscriber lagging past the configured threshold
// has its oldest undelivered events dropped and receives a synthesized
// `subscriber_overflow` notice; the subscription remains open. Per topic and
// per subscriber, delivered sequences are strictly increasing. Across
// topics, no ordering is guaranteed.

mod filter;

pub use filter::EventFilter;

use crate::config::BusConfig;
use crate::error::Result;
use crate::store::TaskStore;
use crate::types::{Event, EventType};
use chrono::Utc;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Well-known topics.
pub const TOPIC_TASKS: &str = "tasks";
pub const TOPIC_MEMORY: &str = "memory";
pub const TOPIC_SYSTEM: &str = "system";

struct Topic {
    seq: AtomicU64,
    tx: broadcast::Sender<Event>,
}

pub struct EventBus {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    /// Persistence target for replay; `None` disables retention.
    store: Option<Arc<TaskStore>>,
    config: BusConfig,
}

impl EventBus {
    pub fn new(store: Option<Arc<TaskStore>>, config: BusConfig) -> Self {
        EventBus { topics: RwLock::new(HashMap::new()), store, config }
    }

    /// Ephemeral bus for tests and tools that need no replay.
    pub fn in_memory() -> Self {
        EventBus::new(None, BusConfig::default())
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().get(name) {
            return Arc::clone(topic);
        }
        let mut topics = self.topics.write();
        // Double-checked: another writer may have created it
        if let Some(topic) = topics.get(name) {
            return Arc::clone(topic);
        }
        // Seed the sequence from persisted history so replay cursors stay
        // valid across restarts
        let seed = self
            .store
            .as_ref()
            .and_then(|s| s.max_event_sequence(name).ok())
            .unwrap_or(0);
        let (tx, _) = broadcast::channel(self.config.lag_threshold.max(16));
        let topic = Arc::new(Topic { seq: AtomicU64::new(seed), tx });
        topics.insert(name.to_string(), Arc::clone(&topic));
        topic
    }

    /// Publish an event: assigns the next per-topic sequence, persists it
    /// when retention is enabled, and fans out to live subscribers. Returns
    /// the assigned sequence.
    pub fn publish(&self, topic_name: &str, mut event: Event) -> u64 {
        let topic = self.topic(topic_name);
        let sequence = topic.seq.fetch_add(1, Ordering::SeqCst) + 1;
        event.topic = topic_name.to_string();
        event.sequence = sequence;

        if self.config.retention_hours > 0 {
            if let Some(store) = &self.store {
                if let Err(e) = store.append_event(&event) {
                    warn!("[bus] Failed to persist event {}#{}: {}", topic_name, sequence, e);
                }
            }
        }

        // No receivers is not an error — events simply age into the log
        let _ = topic.tx.send(event);
        sequence
    }

    /// Subscribe to a topic with a filter. The returned stream is lazy; each
    /// subscription owns an independent cursor.
    pub fn subscribe(&self, topic_name: &str, filter: EventFilter) -> Subscription {
        let topic = self.topic(topic_name);
        Subscription {
            topic: topic_name.to_string(),
            rx: topic.tx.subscribe(),
            filter,
        }
    }

    /// Persisted events on `topic` after `since_sequence`, passed through
    /// `filter`, in sequence order. Reconnecting subscribers replay first and
    /// then switch to live delivery.
    pub fn replay(
        &self,
        topic_name: &str,
        since_sequence: u64,
        filter: &EventFilter,
    ) -> Result<Vec<Event>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let events = store.events_since(topic_name, since_sequence, u32::MAX)?;
        Ok(events.into_iter().filter(|e| filter.matches(e)).collect())
    }

    /// Current sequence for a topic (0 when nothing was published).
    pub fn current_sequence(&self, topic_name: &str) -> u64 {
        self.topic(topic_name).seq.load(Ordering::SeqCst)
    }

    /// Prune persisted events past the retention window. Called by the
    /// maintenance task.
    pub fn prune_expired(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        if self.config.retention_hours == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.retention_hours as i64);
        store.prune_events_before(cutoff)
    }
}

/// A live, filtered subscription. `next()` blocks until a matching event
/// arrives; a lagging subscriber receives a `subscriber_overflow` notice in
/// place of its dropped events and keeps receiving.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    debug!(
                        "[bus] Subscriber on '{}' lagged — dropped {} oldest events",
                        self.topic, dropped
                    );
                    return Some(overflow_event(&self.topic, dropped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by drain loops.
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(dropped)) => {
                    return Some(overflow_event(&self.topic, dropped));
                }
                Err(_) => return None,
            }
        }
    }
}

/// Synthesized out-of-band notice (sequence 0) telling a subscriber its
/// oldest undelivered events were dropped.
fn overflow_event(topic: &str, dropped: u64) -> Event {
    let mut event = Event::new(
        EventType::System,
        None,
        serde_json::json!({"kind": "subscriber_overflow", "dropped": dropped}),
    );
    event.topic = topic.to_string();
    event
}

/// Spawn the bus maintenance loop: prunes the persisted log past retention.
pub fn spawn_maintenance(bus: Arc<EventBus>, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(600);
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            match bus.prune_expired() {
                Ok(0) => {}
                Ok(n) => debug!("[bus] Retention pass pruned {} events", n),
                Err(e) => warn!("[bus] Retention pass failed: {}", e),
            }
            // Sleep in slices so shutdown is prompt
            let mut slept = Duration::ZERO;
            while slept < interval && !stop.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                slept += Duration::from_secs(1);
            }
        }
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn event(repo: &str) -> Event {
        Event::new(EventType::TaskCreated, Some(repo.into()), serde_json::json!({}))
    }

    #[tokio::test]
    async fn sequences_are_monotonic_per_topic() {
        let bus = EventBus::in_memory();
        let mut sub = bus.subscribe(TOPIC_TASKS, EventFilter::any());
        for _ in 0..5 {
            bus.publish(TOPIC_TASKS, event("repoA"));
        }
        let mut last = 0;
        for _ in 0..5 {
            let e = sub.next().await.unwrap();
            assert!(e.sequence > last);
            last = e.sequence;
        }
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn topics_do_not_share_sequences() {
        let bus = EventBus::in_memory();
        bus.publish(TOPIC_TASKS, event("r"));
        bus.publish(TOPIC_TASKS, event("r"));
        bus.publish(TOPIC_MEMORY, event("r"));
        assert_eq!(bus.current_sequence(TOPIC_TASKS), 2);
        assert_eq!(bus.current_sequence(TOPIC_MEMORY), 1);
    }

    #[tokio::test]
    async fn filters_scope_delivery() {
        let bus = EventBus::in_memory();
        let mut sub = bus.subscribe(TOPIC_TASKS, EventFilter::for_repository("repoA"));
        bus.publish(TOPIC_TASKS, event("repoB"));
        bus.publish(TOPIC_TASKS, event("repoA"));
        let e = sub.next().await.unwrap();
        assert_eq!(e.repository.as_deref(), Some("repoA"));
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_overflow_and_stays_open() {
        let bus = EventBus::new(
            None,
            BusConfig { lag_threshold: 16, retention_hours: 0 },
        );
        let mut sub = bus.subscribe(TOPIC_TASKS, EventFilter::any());
        // Overrun the channel while the subscriber sleeps
        for _ in 0..40 {
            bus.publish(TOPIC_TASKS, event("repoA"));
        }
        let first = sub.next().await.unwrap();
        assert_eq!(first.payload["kind"], serde_json::json!("subscriber_overflow"));
        assert!(first.payload["dropped"].as_u64().unwrap() > 0);

        // Still receiving: newer events flow after the notice
        let next = sub.next().await.unwrap();
        assert!(next.sequence > 0);

        // And a freshly published event still arrives
        bus.publish(TOPIC_TASKS, event("repoA"));
        let mut seen_new = false;
        while let Some(e) = sub.try_next() {
            if e.sequence == bus.current_sequence(TOPIC_TASKS) {
                seen_new = true;
            }
        }
        assert!(seen_new);
    }

    #[tokio::test]
    async fn replay_round_trips_through_persistence() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let bus = EventBus::new(Some(Arc::clone(&store)), BusConfig::default());
        for _ in 0..10 {
            bus.publish(TOPIC_TASKS, event("repoA"));
        }
        let replayed = bus.replay(TOPIC_TASKS, 7, &EventFilter::any()).unwrap();
        let seqs: Vec<u64> = replayed.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![8, 9, 10]);

        // Filter applies to replay exactly as to live delivery
        let filtered = bus
            .replay(TOPIC_TASKS, 0, &EventFilter::for_repository("repoZ"))
            .unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn sequences_resume_after_restart() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        {
            let bus = EventBus::new(Some(Arc::clone(&store)), BusConfig::default());
            bus.publish(TOPIC_TASKS, event("repoA"));
            bus.publish(TOPIC_TASKS, event("repoA"));
        }
        // A new bus over the same store continues the numbering
        let bus = EventBus::new(Some(store), BusConfig::default());
        let seq = bus.publish(TOPIC_TASKS, event("repoA"));
        assert_eq!(seq, 3);
    }
}
