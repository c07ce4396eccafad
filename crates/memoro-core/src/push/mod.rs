// ── Memoro Core: Push Registry ─────────────────────────────────────────────
// HTTP push delivery to registered endpoints. The dispatcher feeds from the
// event bus; each matching endpoint gets a POST with exponential retry.
// Endpoint health is an EWMA over delivery and probe outcomes; persistent
// failure degrades and eventually deregisters the endpoint. Events already
// delivered over a WebSocket connection are suppressed for the same client
// within a short dedup window.

use crate::bus::{EventBus, EventFilter, TOPIC_MEMORY, TOPIC_SYSTEM, TOPIC_TASKS};
use crate::config::PushConfig;
use crate::error::{Error, Result};
use crate::types::{Event, EventType};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// EWMA smoothing factor for health-score updates.
const EWMA_ALPHA: f64 = 0.3;

/// Full-exhaustion events before an endpoint is dropped outright.
const MAX_CONSECUTIVE_EXHAUSTIONS: u32 = 3;

// ── WebSocket/push duplicate suppression ───────────────────────────────────

/// Remembers (client_id, topic, sequence) deliveries for a short window so a
/// client that is both WebSocket-connected and push-registered sees each
/// event once.
pub struct DedupWindow {
    window: Duration,
    inner: Mutex<HashMap<(String, String, u64), Instant>>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        DedupWindow { window, inner: Mutex::new(HashMap::new()) }
    }

    /// Record a WebSocket delivery.
    pub fn record(&self, client_id: &str, topic: &str, sequence: u64) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.retain(|_, at| now.duration_since(*at) <= self.window);
        inner.insert((client_id.to_string(), topic.to_string(), sequence), now);
    }

    /// Whether a push for this tuple should be suppressed.
    pub fn suppressed(&self, client_id: &str, topic: &str, sequence: u64) -> bool {
        let inner = self.inner.lock();
        match inner.get(&(client_id.to_string(), topic.to_string(), sequence)) {
            Some(at) => at.elapsed() <= self.window,
            None => false,
        }
    }
}

// ── Registration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRegistration {
    pub url: String,
    pub client_id: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: u32,
    /// Repository scope; empty = all repositories.
    #[serde(default)]
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushEndpointInfo {
    pub client_id: String,
    pub url: String,
    pub health_score: f64,
    pub degraded: bool,
}

struct EndpointState {
    registration: PushRegistration,
    health_score: f64,
    consecutive_exhaustions: u32,
    degraded: bool,
}

pub struct PushRegistry {
    endpoints: RwLock<HashMap<String, EndpointState>>,
    client: reqwest::Client,
    config: PushConfig,
    bus: Arc<EventBus>,
    dedup: Arc<DedupWindow>,
}

impl PushRegistry {
    pub fn new(bus: Arc<EventBus>, config: PushConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        let dedup = Arc::new(DedupWindow::new(Duration::from_secs(config.dedup_window_secs)));
        Arc::new(PushRegistry {
            endpoints: RwLock::new(HashMap::new()),
            client,
            config,
            bus,
            dedup,
        })
    }

    /// The dedup window shared with the WebSocket hub.
    pub fn dedup(&self) -> Arc<DedupWindow> {
        Arc::clone(&self.dedup)
    }

    pub fn register(&self, registration: PushRegistration) -> Result<()> {
        if registration.url.trim().is_empty() {
            return Err(Error::validation("push registration requires a url"));
        }
        if registration.client_id.trim().is_empty() {
            return Err(Error::validation("push registration requires a client_id"));
        }
        info!(
            "[push] Registered endpoint {} for client {}",
            registration.url, registration.client_id
        );
        self.endpoints.write().insert(
            registration.client_id.clone(),
            EndpointState {
                registration,
                health_score: 1.0,
                consecutive_exhaustions: 0,
                degraded: false,
            },
        );
        Ok(())
    }

    pub fn deregister(&self, client_id: &str) -> bool {
        let removed = self.endpoints.write().remove(client_id).is_some();
        if removed {
            info!("[push] Deregistered endpoint for client {}", client_id);
            self.bus.publish(
                TOPIC_SYSTEM,
                Event::new(
                    EventType::System,
                    None,
                    serde_json::json!({"kind": "push_deregistered", "client_id": client_id}),
                ),
            );
        }
        removed
    }

    pub fn endpoints(&self) -> Vec<PushEndpointInfo> {
        self.endpoints
            .read()
            .values()
            .map(|state| PushEndpointInfo {
                client_id: state.registration.client_id.clone(),
                url: state.registration.url.clone(),
                health_score: state.health_score,
                degraded: state.degraded,
            })
            .collect()
    }

    /// Endpoints whose scope matches the event's repository and whose client
    /// has not just received it over WebSocket.
    fn targets_for(&self, event: &Event) -> Vec<(String, String)> {
        self.endpoints
            .read()
            .values()
            .filter(|state| match (&event.repository, &state.registration.repositories) {
                (_, scoped) if scoped.is_empty() => true,
                (Some(repo), scoped) => scoped.contains(repo),
                (None, _) => true,
            })
            .filter(|state| {
                !self.dedup.suppressed(
                    &state.registration.client_id,
                    &event.topic,
                    event.sequence,
                )
            })
            .map(|state| {
                (state.registration.client_id.clone(), state.registration.url.clone())
            })
            .collect()
    }

    /// Deliver one event to one endpoint with exponential retry. On full
    /// exhaustion the endpoint is degraded; three exhaustions in a row drop
    /// it entirely.
    async fn deliver(self: &Arc<Self>, client_id: &str, url: &str, event: &Event) {
        let target = format!("{}/events", url.trim_end_matches('/'));
        for attempt in 1..=self.config.max_attempts {
            let sent = self
                .client
                .post(&target)
                .json(event)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match sent {
                Ok(response) if response.status().is_success() => {
                    self.record_outcome(client_id, true);
                    return;
                }
                Ok(response) => {
                    debug!(
                        "[push] {} returned {} (attempt {}/{})",
                        target,
                        response.status(),
                        attempt,
                        self.config.max_attempts
                    );
                }
                Err(e) => {
                    debug!(
                        "[push] {} unreachable (attempt {}/{}): {}",
                        target, attempt, self.config.max_attempts, e
                    );
                }
            }
            self.record_outcome(client_id, false);
            if attempt < self.config.max_attempts {
                let backoff = self
                    .config
                    .retry_base_secs
                    .saturating_mul(2u64.saturating_pow(attempt - 1))
                    .min(self.config.retry_max_secs);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }
        self.record_exhaustion(client_id);
    }

    fn record_outcome(&self, client_id: &str, success: bool) {
        let mut endpoints = self.endpoints.write();
        if let Some(state) = endpoints.get_mut(client_id) {
            let outcome = if success { 1.0 } else { 0.0 };
            state.health_score = (1.0 - EWMA_ALPHA) * state.health_score + EWMA_ALPHA * outcome;
            if success {
                state.consecutive_exhaustions = 0;
                state.degraded = false;
            }
        }
    }

    fn record_exhaustion(&self, client_id: &str) {
        let drop_endpoint = {
            let mut endpoints = self.endpoints.write();
            match endpoints.get_mut(client_id) {
                Some(state) => {
                    state.degraded = true;
                    state.health_score /= 2.0;
                    state.consecutive_exhaustions += 1;
                    warn!(
                        "[push] Delivery to {} exhausted (streak {}, score {:.2})",
                        client_id, state.consecutive_exhaustions, state.health_score
                    );
                    state.consecutive_exhaustions >= MAX_CONSECUTIVE_EXHAUSTIONS
                }
                None => false,
            }
        };
        if drop_endpoint {
            self.deregister(client_id);
        }
    }

    /// Probe one endpoint's `/health`; returns the updated score.
    async fn probe(self: &Arc<Self>, client_id: &str, url: &str) -> Option<f64> {
        let target = format!("{}/health", url.trim_end_matches('/'));
        let healthy = matches!(
            self.client
                .get(&target)
                .timeout(Duration::from_secs(self.config.probe_timeout_secs))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        );
        self.record_outcome(client_id, healthy);
        self.endpoints.read().get(client_id).map(|s| s.health_score)
    }
}

/// Dispatcher: one task per delivery-bearing topic, fanning events out to
/// matching endpoints.
pub fn spawn_dispatcher(
    registry: Arc<PushRegistry>,
    stop: Arc<AtomicBool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    [TOPIC_TASKS, TOPIC_MEMORY]
        .into_iter()
        .map(|topic| {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            let mut subscription = registry.bus.subscribe(topic, EventFilter::any());
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
                    // Overflow notices are bus-internal
                    if event.sequence == 0 {
                        continue;
                    }
                    for (client_id, url) in registry.targets_for(&event) {
                        let registry = Arc::clone(&registry);
                        let event = event.clone();
                        tokio::spawn(async move {
                            registry.deliver(&client_id, &url, &event).await;
                        });
                    }
                }
            })
        })
        .collect()
}

/// Health probe loop: GET each endpoint's `/health` every interval and
/// deregister endpoints that fall below the score threshold.
pub fn spawn_health_prober(
    registry: Arc<PushRegistry>,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(registry.config.probe_interval_secs);
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let snapshot: Vec<(String, String)> = registry
                .endpoints
                .read()
                .values()
                .map(|s| (s.registration.client_id.clone(), s.registration.url.clone()))
                .collect();
            for (client_id, url) in snapshot {
                if let Some(score) = registry.probe(&client_id, &url).await {
                    if score < registry.config.score_threshold {
                        warn!(
                            "[push] {} below health threshold ({:.2}) — deregistering",
                            client_id, score
                        );
                        registry.deregister(&client_id);
                    }
                }
            }
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

    fn registration(client_id: &str, repos: &[&str]) -> PushRegistration {
        PushRegistration {
            url: "http://127.0.0.1:1/hook".into(),
            client_id: client_id.into(),
            version: "1".into(),
            capabilities: 0,
            repositories: repos.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn registry() -> Arc<PushRegistry> {
        PushRegistry::new(Arc::new(EventBus::in_memory()), PushConfig::default())
    }

    fn event(repo: Option<&str>, sequence: u64) -> Event {
        let mut e = Event::new(
            EventType::TaskCreated,
            repo.map(String::from),
            serde_json::json!({}),
        );
        e.topic = TOPIC_TASKS.into();
        e.sequence = sequence;
        e
    }

    #[test]
    fn registration_validation() {
        let registry = registry();
        assert!(registry.register(registration("c1", &[])).is_ok());
        let mut bad = registration("c2", &[]);
        bad.url = " ".into();
        assert_eq!(registry.register(bad).unwrap_err().kind(), "validation");
    }

    #[test]
    fn targets_respect_repository_scope() {
        let registry = registry();
        registry.register(registration("all", &[])).unwrap();
        registry.register(registration("scoped", &["repoA"])).unwrap();

        let targets = registry.targets_for(&event(Some("repoA"), 1));
        assert_eq!(targets.len(), 2);

        let targets = registry.targets_for(&event(Some("repoB"), 2));
        let ids: Vec<&str> = targets.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["all"]);

        // Global events reach everyone
        assert_eq!(registry.targets_for(&event(None, 3)).len(), 2);
    }

    #[test]
    fn websocket_delivery_suppresses_push() {
        let registry = registry();
        registry.register(registration("c1", &[])).unwrap();
        registry.dedup().record("c1", TOPIC_TASKS, 5);
        assert!(registry.targets_for(&event(Some("r"), 5)).is_empty());
        // A different sequence still goes out
        assert_eq!(registry.targets_for(&event(Some("r"), 6)).len(), 1);
    }

    #[test]
    fn exhaustion_degrades_then_deregisters() {
        let registry = registry();
        registry.register(registration("c1", &[])).unwrap();

        registry.record_exhaustion("c1");
        let info = &registry.endpoints()[0];
        assert!(info.degraded);
        assert!(info.health_score < 1.0);

        registry.record_exhaustion("c1");
        registry.record_exhaustion("c1");
        assert!(registry.endpoints().is_empty());
    }

    #[test]
    fn successful_delivery_resets_exhaustion_streak() {
        let registry = registry();
        registry.register(registration("c1", &[])).unwrap();
        registry.record_exhaustion("c1");
        registry.record_exhaustion("c1");
        registry.record_outcome("c1", true);
        registry.record_exhaustion("c1");
        // Streak was reset, endpoint survives
        assert_eq!(registry.endpoints().len(), 1);
    }

    #[test]
    fn ewma_climbs_and_falls() {
        let registry = registry();
        registry.register(registration("c1", &[])).unwrap();
        for _ in 0..5 {
            registry.record_outcome("c1", false);
        }
        let low = registry.endpoints()[0].health_score;
        assert!(low < 0.3);
        for _ in 0..10 {
            registry.record_outcome("c1", true);
        }
        let high = registry.endpoints()[0].health_score;
        assert!(high > 0.9);
    }

    #[test]
    fn dedup_window_expires() {
        let dedup = DedupWindow::new(Duration::from_millis(10));
        dedup.record("c1", "tasks", 1);
        assert!(dedup.suppressed("c1", "tasks", 1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!dedup.suppressed("c1", "tasks", 1));
        assert!(!dedup.suppressed("c2", "tasks", 1));
    }
}
