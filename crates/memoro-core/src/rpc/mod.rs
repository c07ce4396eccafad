// ── Memoro Core: Resilient RPC ─────────────────────────────────────────────
// Request/response over JSON-RPC 2.0 with retry, exponential backoff, a
// per-endpoint circuit breaker, a bounded connection pool, and a background
// health probe. Both the Memory Protocol client and the AI providers ride on
// this layer.
//
// Module layout:
//   types      — JSON-RPC framing structs
//   transport  — call() with retry/backoff/jitter and breaker gating
//   breaker    — sliding-window circuit breaker state machine
//   pool       — bounded pool of transport handles
//   health     — background probe driving online/offline transitions

mod breaker;
mod health;
mod pool;
mod transport;
pub mod types;

pub use breaker::{BreakerState, CircuitBreaker};
pub use health::{spawn_health_prober, OnlineState};
pub use pool::{ConnectionPool, PoolHandle, PoolItem, PoolMetrics};
pub use transport::{parse_retry_after, RpcTransport};

impl PoolItem for std::sync::Arc<RpcTransport> {}
