// ── Memoro Core: Call Context ──────────────────────────────────────────────
// Every cross-component call carries a `Ctx` with a deadline and a cooperative
// cancellation flag. Cancellation is checked between retries and before each
// network operation; in-flight sleeps wake in short slices so a cancel takes
// effect promptly.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity at which interruptible sleeps re-check cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Ctx {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl Ctx {
    /// A context with no deadline, used by background tasks.
    pub fn background() -> Self {
        Ctx { deadline: None, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    /// A fresh context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Ctx {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Derive a child context whose deadline is the sooner of the parent's
    /// and `timeout` from now. Cancellation is shared with the parent.
    pub fn child_timeout(&self, timeout: Duration) -> Self {
        let child_deadline = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(d) => Some(d.min(child_deadline)),
            None => Some(child_deadline),
        };
        Ctx { deadline, cancelled: Arc::clone(&self.cancelled) }
    }

    /// A handle that can cancel this context (and all children) from elsewhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancelled))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Time left before the deadline. `None` means no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_expired(&self) -> bool {
        matches!(self.remaining(), Some(r) if r.is_zero())
    }

    /// Fail fast if the caller cancelled or the deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.deadline_expired() {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Sleep for `duration`, clamped to the remaining deadline, waking early
    /// on cancellation. Returns the context state after waking.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        let capped = match self.remaining() {
            Some(r) => duration.min(r),
            None => duration,
        };
        let wake_at = Instant::now() + capped;
        loop {
            let left = wake_at.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            tokio::time::sleep(left.min(SLEEP_SLICE)).await;
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
        self.check()
    }
}

/// Cancels the context it was derived from. Cheap to clone and send across
/// tasks.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
