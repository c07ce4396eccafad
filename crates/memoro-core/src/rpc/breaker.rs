// Per-endpoint circuit breaker with a sliding failure window.
//
// States:
//   Closed   — normal operation; failures are counted within a sliding window
//   Open     — rejecting requests until the cooldown elapses
//   HalfOpen — cooldown expired; exactly one probe request is allowed
//
// A failed probe re-opens the circuit with a doubled cooldown, up to the
// configured ceiling. A successful probe closes it and resets the cooldown.

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    /// Failure timestamps inside the sliding window (closed state only).
    failures: VecDeque<Instant>,
    /// When the circuit tripped open.
    opened_at: Option<Instant>,
    /// Current cooldown; doubles on each failed probe up to the ceiling.
    cooldown: Duration,
    /// A half-open probe is in flight — further calls are rejected.
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = Duration::from_secs(config.cooldown_secs);
        CircuitBreaker {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                cooldown,
                probe_in_flight: false,
            }),
        }
    }

    /// Gate a call. `Ok(())` admits it; `Err(circuit_open)` rejects it
    /// without any network I/O. In half-open, only the first caller per
    /// cooldown is admitted as the probe.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened = inner.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened.elapsed();
                if elapsed >= inner.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("[breaker] Cooldown elapsed — admitting probe");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        cooldown_secs: (inner.cooldown - elapsed).as_secs().max(1),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::CircuitOpen { cooldown_secs: inner.cooldown.as_secs().max(1) })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call: closes the circuit and resets the cooldown.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!("[breaker] Probe succeeded — circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.cooldown = Duration::from_secs(self.config.cooldown_secs);
    }

    /// Record a failed call. In closed state the sliding window decides
    /// whether to trip; in half-open the circuit re-opens with a doubled
    /// cooldown.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                let now = Instant::now();
                let window = Duration::from_secs(self.config.window_secs);
                inner.failures.push_back(now);
                while let Some(&oldest) = inner.failures.front() {
                    if now.duration_since(oldest) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        "[breaker] {} failures within {}s — circuit open for {}s",
                        inner.failures.len(),
                        self.config.window_secs,
                        inner.cooldown.as_secs()
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                }
            }
            BreakerState::HalfOpen | BreakerState::Open => {
                let ceiling = Duration::from_secs(self.config.cooldown_ceiling_secs);
                inner.cooldown = (inner.cooldown * 2).min(ceiling);
                warn!(
                    "[breaker] Probe failed — circuit re-opened, cooldown {}s",
                    inner.cooldown.as_secs()
                );
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
