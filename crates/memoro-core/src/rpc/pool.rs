// Bounded pool of reusable transport handles. Waiters block up to the
// context deadline; handles failing their liveness check are discarded on
// release. All state mutations happen under one mutex; waiters are woken
// through a Notify.

use crate::context::Ctx;
use crate::error::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Slice length for deadline-aware waits.
const WAIT_SLICE: Duration = Duration::from_millis(250);

/// Items a pool can hold. `is_live` is consulted on release; dead handles
/// are dropped instead of returned to the idle set.
pub trait PoolItem: Send + 'static {
    fn is_live(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    pub in_use: usize,
    pub idle: usize,
    pub wait_queue_depth: usize,
    pub avg_acquire_latency_ms: u64,
}

struct State<T> {
    idle: Vec<T>,
    in_use: usize,
    waiters: usize,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    capacity: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    total_wait_ms: AtomicU64,
    acquires: AtomicU64,
}

pub struct ConnectionPool<T: PoolItem> {
    shared: Arc<Shared<T>>,
}

impl<T: PoolItem> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        ConnectionPool { shared: Arc::clone(&self.shared) }
    }
}

impl<T: PoolItem> ConnectionPool<T> {
    /// A pool that lazily constructs up to `capacity` items via `factory`.
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        ConnectionPool {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    idle: Vec::new(),
                    in_use: 0,
                    waiters: 0,
                    closed: false,
                }),
                notify: Notify::new(),
                capacity,
                factory: Box::new(factory),
                total_wait_ms: AtomicU64::new(0),
                acquires: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a handle, blocking until capacity frees or the context
    /// deadline passes (`pool_exhausted`). Cancellation surfaces as
    /// `cancelled`; a shut-down pool as `pool_closed`.
    pub async fn acquire(&self, ctx: &Ctx) -> Result<PoolHandle<T>> {
        let started = Instant::now();
        loop {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            {
                let mut state = self.shared.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }
                if let Some(item) = state.idle.pop() {
                    state.in_use += 1;
                    drop(state);
                    self.record_wait(started);
                    return Ok(self.handle(item));
                }
                if state.in_use + state.idle.len() < self.shared.capacity {
                    let item = (self.shared.factory)();
                    state.in_use += 1;
                    drop(state);
                    self.record_wait(started);
                    return Ok(self.handle(item));
                }
                if ctx.deadline_expired() {
                    return Err(Error::PoolExhausted);
                }
                state.waiters += 1;
            }

            let wait = match ctx.remaining() {
                Some(r) => r.min(WAIT_SLICE),
                None => WAIT_SLICE,
            };
            let _ = tokio::time::timeout(wait, self.shared.notify.notified()).await;
            self.shared.state.lock().waiters -= 1;

            if ctx.deadline_expired() {
                return Err(Error::PoolExhausted);
            }
        }
    }

    /// Shut the pool down: idle handles are dropped, waiters fail with
    /// `pool_closed`, in-flight handles are discarded on release.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.idle.clear();
        drop(state);
        self.shared.notify.notify_waiters();
        debug!("[pool] Closed");
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.shared.state.lock();
        let acquires = self.shared.acquires.load(Ordering::Relaxed).max(1);
        PoolMetrics {
            in_use: state.in_use,
            idle: state.idle.len(),
            wait_queue_depth: state.waiters,
            avg_acquire_latency_ms: self.shared.total_wait_ms.load(Ordering::Relaxed) / acquires,
        }
    }

    fn record_wait(&self, started: Instant) {
        self.shared
            .total_wait_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        self.shared.acquires.fetch_add(1, Ordering::Relaxed);
    }

    fn handle(&self, item: T) -> PoolHandle<T> {
        PoolHandle { item: Some(item), shared: Arc::downgrade(&self.shared) }
    }
}

impl<T> Shared<T> {
    fn give_back(&self, item: T)
    where
        T: PoolItem,
    {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if !state.closed && item.is_live() {
            state.idle.push(item);
        }
        drop(state);
        self.notify.notify_one();
    }
}

/// A borrowed pool item. Returned to the pool on drop; handles whose item
/// fails the liveness check are discarded instead.
#[derive(Debug)]
pub struct PoolHandle<T: PoolItem> {
    item: Option<T>,
    shared: Weak<Shared<T>>,
}

impl<T: PoolItem> Deref for PoolHandle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().expect("pool handle accessed after release")
    }
}

impl<T: PoolItem> Drop for PoolHandle<T> {
    fn drop(&mut self) {
        if let (Some(item), Some(shared)) = (self.item.take(), self.shared.upgrade()) {
            shared.give_back(item);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug)]
    struct FakeConn {
        live: Arc<AtomicBool>,
    }

    impl PoolItem for FakeConn {
        fn is_live(&self) -> bool {
            self.live.load(Ordering::Relaxed)
        }
    }

    fn pool(capacity: usize) -> ConnectionPool<FakeConn> {
        ConnectionPool::new(capacity, || FakeConn { live: Arc::new(AtomicBool::new(true)) })
    }

    #[tokio::test]
    async fn acquire_and_release_round_trip() {
        let pool = pool(2);
        let ctx = Ctx::with_timeout(Duration::from_secs(1));
        let a = pool.acquire(&ctx).await.unwrap();
        let b = pool.acquire(&ctx).await.unwrap();
        assert_eq!(pool.metrics().in_use, 2);
        drop(a);
        drop(b);
        let m = pool.metrics();
        assert_eq!(m.in_use, 0);
        assert_eq!(m.idle, 2);
    }

    #[tokio::test]
    async fn saturated_pool_times_out_with_pool_exhausted() {
        let pool = pool(1);
        let ctx = Ctx::with_timeout(Duration::from_secs(5));
        let _held = pool.acquire(&ctx).await.unwrap();

        let short = Ctx::with_timeout(Duration::from_millis(50));
        let err = pool.acquire(&short).await.unwrap_err();
        assert_eq!(err.kind(), "pool_exhausted");
    }

    #[tokio::test]
    async fn waiter_wakes_when_capacity_frees() {
        let pool = pool(1);
        let ctx = Ctx::with_timeout(Duration::from_secs(5));
        let held = pool.acquire(&ctx).await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let ctx = Ctx::with_timeout(Duration::from_secs(5));
            pool2.acquire(&ctx).await.map(|_| ())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dead_handles_are_discarded_on_release() {
        let pool = pool(1);
        let ctx = Ctx::with_timeout(Duration::from_secs(1));
        let handle = pool.acquire(&ctx).await.unwrap();
        handle.live.store(false, Ordering::Relaxed);
        drop(handle);
        let m = pool.metrics();
        assert_eq!(m.idle, 0);
        assert_eq!(m.in_use, 0);
        // The next acquire builds a fresh item
        let fresh = pool.acquire(&ctx).await.unwrap();
        assert!(fresh.is_live());
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquires() {
        let pool = pool(1);
        pool.close();
        let ctx = Ctx::with_timeout(Duration::from_secs(1));
        let err = pool.acquire(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), "pool_closed");
    }
}
