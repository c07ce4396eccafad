// ── Memoro Core: WebSocket Hub ─────────────────────────────────────────────
// Connection lifecycle, subscription registry, and broadcast fan-out.
//
// The hub subscribes to the event bus and routes each event to matching
// connections' bounded send queues (drop-oldest on overflow). Reconnecting
// clients present per-topic `last_sequence` cursors; the hub replays the
// persisted log past the cursor and then switches to live delivery, with a
// per-connection sequence guard keeping the stream strictly increasing and
// duplicate-free across the handover. Socket pumping (the actual
// read/write/ping loop) lives in the server crate.

mod connection;
pub mod protocol;

pub use connection::{Connection, SendQueue};
pub use protocol::{
    check_client_version, parse_client_message, ClientMessage, SubscribeRequest, WsEnvelope,
    CLOSE_VERSION_INCOMPATIBLE,
};

use crate::bus::{EventBus, EventFilter, TOPIC_MEMORY, TOPIC_SYSTEM, TOPIC_TASKS};
use crate::config::HubConfig;
use crate::error::Result;
use crate::push::DedupWindow;
use crate::types::{Event, EventType};
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct Hub {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    bus: Arc<EventBus>,
    config: HubConfig,
    /// Shared with the push registry so WebSocket delivery suppresses
    /// duplicate pushes for the same client.
    dedup: Option<Arc<DedupWindow>>,
    dropped_events: AtomicU64,
}

impl Hub {
    pub fn new(bus: Arc<EventBus>, config: HubConfig, dedup: Option<Arc<DedupWindow>>) -> Arc<Self> {
        Arc::new(Hub {
            connections: RwLock::new(HashMap::new()),
            bus,
            config,
            dedup,
            dropped_events: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.config.ping_period_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.config.pong_wait_secs)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.config.write_deadline_secs)
    }

    /// Validate the client-version header presented at upgrade.
    pub fn check_version(&self, header: Option<&str>) -> Result<u32> {
        check_client_version(header, self.config.min_client_version)
    }

    /// Register a fresh connection.
    pub fn connect(&self) -> Arc<Connection> {
        let id = uuid::Uuid::new_v4().to_string();
        let connection = Arc::new(Connection::new(id.clone(), self.config.send_queue_capacity));
        self.connections.write().insert(id.clone(), Arc::clone(&connection));
        info!("[hub] Connection {} registered ({} total)", id, self.connection_count());
        connection
    }

    /// Remove a connection. Called on every exit path; fold the
    /// connection's drop counter into the hub-wide one before releasing.
    pub fn disconnect(&self, connection_id: &str) {
        if let Some(connection) = self.connections.write().remove(connection_id) {
            self.dropped_events
                .fetch_add(connection.queue().dropped(), Ordering::Relaxed);
            info!(
                "[hub] Connection {} released ({} remaining)",
                connection_id,
                self.connection_count()
            );
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Frames dropped to overflow across all closed connections.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Apply a subscribe message: set filters, then replay any presented
    /// cursors before switching the connection live.
    pub fn apply_subscription(
        &self,
        connection: &Arc<Connection>,
        request: SubscribeRequest,
    ) -> Result<()> {
        let mut event_types = Vec::with_capacity(request.event_types.len());
        for raw in &request.event_types {
            event_types.push(EventType::parse(raw)?);
        }
        connection.set_client_id(request.client_id);
        connection.set_filters(request.repositories, event_types);
        connection.authenticated.store(true, Ordering::Relaxed);

        if !request.last_sequences.is_empty() {
            connection.begin_replay();
            for (topic, since) in &request.last_sequences {
                connection.seed_cursor(topic, *since);
                let events = self.bus.replay(topic, *since, &EventFilter::any())?;
                debug!(
                    "[hub] Replaying {} events on '{}' after #{} for {}",
                    events.len(),
                    topic,
                    since,
                    connection.id
                );
                for event in events {
                    if connection.matches(&event) {
                        connection.deliver(&event);
                    }
                }
            }
            connection.finish_replay();
        }
        Ok(())
    }

    /// Route one bus event to every matching connection.
    pub fn dispatch(&self, event: &Event) {
        let connections = self.connections.read();
        for connection in connections.values() {
            if !connection.authenticated.load(Ordering::Relaxed) {
                continue;
            }
            if !connection.matches(event) {
                continue;
            }
            let delivered = connection.offer(event);
            if delivered {
                if let (Some(dedup), Some(client_id)) = (&self.dedup, connection.client_id()) {
                    dedup.record(&client_id, &event.topic, event.sequence);
                }
            }
        }
    }

    /// Connections whose pong is overdue; the server pump closes them.
    pub fn stale_connections(&self) -> Vec<String> {
        let wait = self.pong_wait();
        self.connections
            .read()
            .values()
            .filter(|c| c.pong_age() > wait)
            .map(|c| c.id.clone())
            .collect()
    }
}

/// Feed the hub from the bus: one dispatcher task per topic.
pub fn spawn_dispatcher(hub: Arc<Hub>, stop: Arc<AtomicBool>) -> Vec<tokio::task::JoinHandle<()>> {
    [TOPIC_TASKS, TOPIC_MEMORY, TOPIC_SYSTEM]
        .into_iter()
        .map(|topic| {
            let hub = Arc::clone(&hub);
            let stop = Arc::clone(&stop);
            let mut subscription = hub.bus.subscribe(topic, EventFilter::any());
            tokio::spawn(async move {
                loop {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    let event = tokio::select! {
                        event = subscription.next() => match event {
                            Some(e) => e,
                            None => break,
                        },
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    };
                    // Overflow notices are per-subscriber; the hub's own lag
                    // is absorbed by the per-connection queues
                    if event.sequence == 0 {
                        continue;
                    }
                    hub.dispatch(&event);
                }
            })
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::store::TaskStore;

    fn event(repo: &str) -> Event {
        Event::new(EventType::TaskCreated, Some(repo.into()), serde_json::json!({}))
    }

    fn store_backed_bus() -> Arc<EventBus> {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        Arc::new(EventBus::new(Some(store), BusConfig::default()))
    }

    fn subscribe_request(repos: Vec<&str>, cursors: &[(&str, u64)]) -> SubscribeRequest {
        SubscribeRequest {
            client_id: Some("cli-1".into()),
            repositories: repos.into_iter().map(String::from).collect(),
            event_types: vec![],
            last_sequences: cursors.iter().map(|(t, s)| (t.to_string(), *s)).collect(),
        }
    }

    fn queued_sequences(connection: &Connection) -> Vec<u64> {
        connection
            .queue()
            .drain()
            .iter()
            .filter_map(|f| f.data.as_ref()?["sequence"].as_u64())
            .collect()
    }

    #[tokio::test]
    async fn dispatch_reaches_matching_subscribed_connections() {
        let bus = store_backed_bus();
        let hub = Hub::new(Arc::clone(&bus), HubConfig::default(), None);
        let conn = hub.connect();
        hub.apply_subscription(&conn, subscribe_request(vec!["repoA"], &[])).unwrap();

        let mut a = event("repoA");
        a.topic = TOPIC_TASKS.into();
        a.sequence = 1;
        let mut b = event("repoB");
        b.topic = TOPIC_TASKS.into();
        b.sequence = 2;
        hub.dispatch(&a);
        hub.dispatch(&b);

        assert_eq!(queued_sequences(&conn), vec![1]);
    }

    #[tokio::test]
    async fn unsubscribed_connections_receive_nothing() {
        let bus = store_backed_bus();
        let hub = Hub::new(bus, HubConfig::default(), None);
        let conn = hub.connect();
        let mut e = event("repoA");
        e.topic = TOPIC_TASKS.into();
        e.sequence = 1;
        hub.dispatch(&e);
        assert!(conn.queue().is_empty());
    }

    #[tokio::test]
    async fn reconnect_replays_then_goes_live() {
        let bus = store_backed_bus();
        // Seed the log with sequences 1..=10
        for _ in 0..10 {
            let mut e = event("repoA");
            e.topic = TOPIC_TASKS.into();
            bus.publish(TOPIC_TASKS, e);
        }

        let hub = Hub::new(Arc::clone(&bus), HubConfig::default(), None);
        let conn = hub.connect();
        hub.apply_subscription(&conn, subscribe_request(vec![], &[("tasks", 7)]))
            .unwrap();

        // Live event continues from 11
        let seq = bus.publish(TOPIC_TASKS, event("repoA"));
        assert_eq!(seq, 11);
        let mut live = event("repoA");
        live.topic = TOPIC_TASKS.into();
        live.sequence = seq;
        hub.dispatch(&live);

        assert_eq!(queued_sequences(&conn), vec![8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn websocket_delivery_records_dedup() {
        let bus = store_backed_bus();
        let dedup = Arc::new(DedupWindow::new(Duration::from_secs(5)));
        let hub = Hub::new(bus, HubConfig::default(), Some(Arc::clone(&dedup)));
        let conn = hub.connect();
        hub.apply_subscription(&conn, subscribe_request(vec![], &[])).unwrap();

        let mut e = event("repoA");
        e.topic = TOPIC_TASKS.into();
        e.sequence = 3;
        hub.dispatch(&e);
        assert!(dedup.suppressed("cli-1", TOPIC_TASKS, 3));
        assert!(!dedup.suppressed("cli-1", TOPIC_TASKS, 4));
    }

    #[tokio::test]
    async fn disconnect_releases_and_counts_drops() {
        let bus = store_backed_bus();
        let hub = Hub::new(
            bus,
            HubConfig { send_queue_capacity: 2, ..Default::default() },
            None,
        );
        let conn = hub.connect();
        hub.apply_subscription(&conn, subscribe_request(vec![], &[])).unwrap();
        for seq in 1..=5u64 {
            let mut e = event("repoA");
            e.topic = TOPIC_TASKS.into();
            e.sequence = seq;
            hub.dispatch(&e);
        }
        assert_eq!(conn.queue().len(), 2);
        let id = conn.id.clone();
        hub.disconnect(&id);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.dropped_events(), 3);
    }

    #[tokio::test]
    async fn rejects_invalid_event_type_in_subscription() {
        let bus = store_backed_bus();
        let hub = Hub::new(bus, HubConfig::default(), None);
        let conn = hub.connect();
        let request = SubscribeRequest {
            event_types: vec!["task_exploded".into()],
            ..Default::default()
        };
        assert_eq!(
            hub.apply_subscription(&conn, request).unwrap_err().kind(),
            "validation"
        );
    }
}
