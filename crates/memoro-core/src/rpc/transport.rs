// ── Memoro Core: RPC Transport ─────────────────────────────────────────────
// JSON-RPC 2.0 over HTTP POST with retry, exponential backoff, and a
// per-endpoint circuit breaker.
//
// Retry policy (defaults 4 attempts, 100ms base, 5s cap, ×2, ±20% jitter):
//   • Retried: network errors, 5xx responses, timeouts, 429 (honoring
//     Retry-After, clamped to the max delay)
//   • Never retried: context cancellation, protocol-level errors (well-formed
//     failure responses), other 4xx

use super::breaker::CircuitBreaker;
use super::types::{JsonRpcRequest, JsonRpcResponse};
use crate::config::{BreakerConfig, RetryConfig};
use crate::context::Ctx;
use crate::error::{Error, Result};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

pub struct RpcTransport {
    client: reqwest::Client,
    /// Full endpoint URL, e.g. "http://127.0.0.1:7737/mcp".
    endpoint: String,
    retry: RetryConfig,
    /// Shared per-endpoint breaker — pooled handles to the same endpoint
    /// trip and recover together.
    breaker: std::sync::Arc<CircuitBreaker>,
    next_id: AtomicU64,
}

/// Outcome of a single attempt, deciding whether the retry loop continues.
enum Attempt {
    Done(serde_json::Value),
    /// Transient failure; `retry_after` comes from a 429 response.
    Transient { error: Error, retry_after: Option<Duration> },
    Fatal(Error),
}

impl RpcTransport {
    pub fn new(endpoint: impl Into<String>, retry: RetryConfig, breaker: BreakerConfig) -> Self {
        Self::with_shared_breaker(
            endpoint,
            retry,
            std::sync::Arc::new(CircuitBreaker::new(breaker)),
        )
    }

    /// Build a handle sharing an existing per-endpoint breaker. The
    /// connection pool uses this so every handle to one endpoint observes
    /// the same circuit state.
    pub fn with_shared_breaker(
        endpoint: impl Into<String>,
        retry: RetryConfig,
        breaker: std::sync::Arc<CircuitBreaker>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        RpcTransport {
            client,
            endpoint: endpoint.into(),
            retry,
            breaker,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue a JSON-RPC call, retrying transient failures per the policy.
    /// The circuit breaker gates every attempt; an open circuit fails fast
    /// with `circuit_open` and performs no network I/O.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        ctx: &Ctx,
    ) -> Result<serde_json::Value> {
        let mut last_error = Error::Offline;

        for attempt in 1..=self.retry.max_attempts {
            ctx.check()?;
            self.breaker.check()?;

            match self.attempt(method, params.clone(), ctx).await {
                Attempt::Done(result) => {
                    self.breaker.record_success();
                    return Ok(result);
                }
                Attempt::Fatal(error) => {
                    // Well-formed failure: the endpoint is alive
                    if matches!(error, Error::Protocol { .. }) {
                        self.breaker.record_success();
                    }
                    return Err(error);
                }
                Attempt::Transient { error, retry_after } => {
                    // Rate limiting is not an endpoint failure
                    if !matches!(error, Error::RateLimited(_)) {
                        self.breaker.record_failure();
                    }
                    warn!(
                        "[rpc] {} attempt {}/{} failed: {}",
                        method, attempt, self.retry.max_attempts, error
                    );
                    last_error = error;
                    if attempt < self.retry.max_attempts {
                        let delay = self.backoff_delay(attempt, retry_after);
                        debug!("[rpc] Backing off {}ms before retry", delay.as_millis());
                        ctx.sleep(delay).await?;
                    }
                }
            }
        }

        Err(last_error)
    }

    /// Light health call used by the background prober.
    pub async fn health(&self, ctx: &Ctx) -> Result<()> {
        self.call(
            "memory_system",
            serde_json::json!({"operation": "health", "options": {}}),
            ctx,
        )
        .await
        .map(|_| ())
    }

    async fn attempt(&self, method: &str, params: serde_json::Value, ctx: &Ctx) -> Attempt {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, Some(params));

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(remaining) = ctx.remaining() {
            if remaining.is_zero() {
                return Attempt::Fatal(Error::Timeout);
            }
            builder = builder.timeout(remaining);
        }

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Attempt::Transient { error: Error::Timeout, retry_after: None }
            }
            Err(_) => return Attempt::Transient { error: Error::Offline, retry_after: None },
        };

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Attempt::Transient {
                error: Error::RateLimited(self.endpoint.clone()),
                retry_after,
            };
        }
        if status.is_server_error() {
            debug!("[rpc] {} returned {}", self.endpoint, status);
            return Attempt::Transient { error: Error::Offline, retry_after: None };
        }
        if status.is_client_error() {
            return Attempt::Fatal(Error::Protocol {
                code: status.as_u16() as i64,
                message: format!("client error {}", status),
            });
        }

        let parsed: JsonRpcResponse = match response.json().await {
            Ok(p) => p,
            Err(_) => return Attempt::Transient { error: Error::Offline, retry_after: None },
        };

        if let Some(err) = parsed.error {
            return Attempt::Fatal(Error::Protocol { code: err.code, message: err.message });
        }
        Attempt::Done(parsed.result.unwrap_or(serde_json::Value::Null))
    }

    /// Exponential backoff with ±20% jitter. A server-provided Retry-After
    /// takes precedence but is clamped to the configured max delay.
    fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(after) = retry_after {
            return after.min(self.retry.max_delay());
        }
        let exp = self.retry.multiplier.saturating_pow(attempt.saturating_sub(1));
        let base_ms = self.retry.base_delay_ms.saturating_mul(exp as u64);
        let capped_ms = base_ms.min(self.retry.max_delay_ms);
        Duration::from_millis(apply_jitter(capped_ms))
    }
}

/// Parse a Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented — falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    header_value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Apply ±20% jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 5) as i64;
    if jitter_range == 0 {
        return base_ms.max(1);
    }
    let offset = (clock_jitter() % (2 * jitter_range + 1)) - jitter_range;
    (base_ms as i64 + offset).max(1) as u64
}

/// Jitter source from the system clock nanos (no extra crate needed).
fn clock_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as i64
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> RpcTransport {
        RpcTransport::new(
            "http://127.0.0.1:1/mcp",
            RetryConfig::default(),
            BreakerConfig::default(),
        )
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let t = transport();
        let d1 = t.backoff_delay(1, None).as_millis() as u64;
        let d2 = t.backoff_delay(2, None).as_millis() as u64;
        let d3 = t.backoff_delay(3, None).as_millis() as u64;
        // ±20% jitter bands around 100ms, 200ms, 400ms
        assert!((80..=120).contains(&d1), "d1={}", d1);
        assert!((160..=240).contains(&d2), "d2={}", d2);
        assert!((320..=480).contains(&d3), "d3={}", d3);
        // Far attempts clamp to the max delay (plus jitter headroom)
        let d10 = t.backoff_delay(10, None);
        assert!(d10 <= Duration::from_millis(6000));
    }

    #[test]
    fn retry_after_is_clamped_to_max_delay() {
        let t = transport();
        let delay = t.backoff_delay(1, Some(Duration::from_secs(120)));
        assert_eq!(delay, t.retry.max_delay());
        // A short Retry-After is honored as-is
        let short = t.backoff_delay(1, Some(Duration::from_secs(2)));
        assert_eq!(short, Duration::from_secs(2));
    }

    #[test]
    fn parse_retry_after_values() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("Wed, 21 Oct"), None);
    }

    #[test]
    fn jitter_stays_in_band() {
        for base in [100u64, 1000, 5000] {
            let jittered = apply_jitter(base);
            let lower = base - base / 5;
            let upper = base + base / 5;
            assert!(jittered >= lower && jittered <= upper, "jitter({}) = {}", base, jittered);
        }
    }

    #[tokio::test]
    async fn cancelled_context_aborts_before_io() {
        let t = transport();
        let ctx = Ctx::background();
        ctx.cancel_handle().cancel();
        let err = t.call("memory_system", serde_json::json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn unreachable_endpoint_exhausts_retries_to_offline() {
        let t = RpcTransport::new(
            "http://127.0.0.1:1/mcp",
            RetryConfig { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 2, multiplier: 2 },
            BreakerConfig::default(),
        );
        let ctx = Ctx::with_timeout(Duration::from_secs(5));
        let err = t.call("memory_system", serde_json::json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err.kind(), "offline" | "timeout"), "kind={}", err.kind());
    }
}
