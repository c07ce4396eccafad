// Background health probe for the RPC transport. Every interval it invokes
// the light `memory_system`/health operation; a failure flips the client to
// offline, the first success flips it back. Transitions are announced on the
// system topic so the sync engine and UI can react.

use super::transport::RpcTransport;
use crate::bus::{EventBus, TOPIC_SYSTEM};
use crate::config::HealthConfig;
use crate::context::Ctx;
use crate::error::Error;
use crate::types::{Event, EventType};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared online/offline flag. Starts offline; the first successful probe
/// transitions to online.
pub struct OnlineState {
    online: AtomicBool,
}

impl OnlineState {
    pub fn new() -> Self {
        OnlineState { online: AtomicBool::new(false) }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Set the flag; returns true when the value changed.
    pub fn set(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::Relaxed) != online
    }
}

impl Default for OnlineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-probe deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn spawn_health_prober(
    transport: Arc<RpcTransport>,
    bus: Arc<EventBus>,
    online: Arc<OnlineState>,
    config: HealthConfig,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config.probe_interval_secs);
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }

            let ctx = Ctx::with_timeout(PROBE_TIMEOUT);
            let probe = transport.health(&ctx).await;
            let reachable = match probe {
                Ok(()) => true,
                // A well-formed remote failure still proves the endpoint is up
                Err(Error::Protocol { .. }) => true,
                Err(e) => {
                    warn!("[health] Probe failed: {}", e);
                    false
                }
            };

            if online.set(reachable) {
                let status = if reachable { "online" } else { "offline" };
                info!("[health] Transitioned {}", status);
                bus.publish(
                    TOPIC_SYSTEM,
                    Event::new(
                        EventType::System,
                        None,
                        serde_json::json!({"kind": status, "endpoint": transport.endpoint()}),
                    ),
                );
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
