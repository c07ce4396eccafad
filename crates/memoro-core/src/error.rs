// ── Memoro Core: Error Types ───────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by failure kind (offline, timeout, conflict…).
//   • Every variant maps to a stable machine-parseable `kind()` string — the
//     CLI prints it next to the human message and derives its exit code from it.
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum Error {
    /// Input violates a contract at a boundary. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Sync conflict that could not be resolved automatically.
    #[error("unresolved conflict on task {task_id}: {message}")]
    Conflict { task_id: String, message: String },

    /// Illegal task status change.
    #[error("invalid transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    /// Another sync is already running for this repository.
    #[error("sync already in progress for repository '{0}'")]
    SyncInProgress(String),

    /// Remote unreachable — callers fall back to local and enqueue.
    #[error("remote unreachable")]
    Offline,

    /// Deadline exceeded.
    #[error("deadline exceeded")]
    Timeout,

    /// Circuit breaker is protecting the endpoint.
    #[error("circuit open: cooling down for {cooldown_secs}s")]
    CircuitOpen { cooldown_secs: u64 },

    /// Provider or self-imposed rate limit hit.
    #[error("rate limited by provider '{0}'")]
    RateLimited(String),

    /// AI cost cap reached for a provider.
    #[error("budget exhausted for provider '{0}'")]
    BudgetExhausted(String),

    /// Every provider in the fallback chain failed.
    #[error("no AI provider available: {}", format_reasons(.reasons))]
    AiUnavailable { reasons: Vec<(String, String)> },

    /// Well-formed remote failure (JSON-RPC error object). Never retried.
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// Caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Pool acquire waited past the context deadline.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Pool has been shut down.
    #[error("connection pool closed")]
    PoolClosed,

    /// Interactive AI session id is unknown.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Interactive AI session lost its pinned provider and must be restarted.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Invariant violation. Log with full context; surface a generic failure.
    #[error("internal error: {0}")]
    Internal(String),
}

fn format_reasons(reasons: &[(String, String)]) -> String {
    if reasons.is_empty() {
        return "no candidate providers".into();
    }
    reasons
        .iter()
        .map(|(p, r)| format!("{}: {}", p, r))
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Kind discriminant and exit codes ───────────────────────────────────────

impl Error {
    /// Stable machine-parseable kind string. CLI output and wire errors use
    /// this, never the Rust variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::SyncInProgress(_) => "sync_in_progress",
            Error::Offline | Error::Network(_) => "offline",
            Error::Timeout => "timeout",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::RateLimited(_) => "rate_limited",
            Error::BudgetExhausted(_) => "budget_exhausted",
            Error::AiUnavailable { .. } => "ai_unavailable",
            Error::Protocol { .. } => "protocol_error",
            Error::Cancelled => "cancelled",
            Error::PoolExhausted => "pool_exhausted",
            Error::PoolClosed => "pool_closed",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionFailed(_) => "session_failed",
            Error::Io(_) | Error::Serialization(_) | Error::Database(_) | Error::Internal(_) => {
                "internal"
            }
        }
    }

    /// Process exit code for CLI commands:
    /// 0 success, 1 usage error, 2 network/remote error, 3 conflict,
    /// 4 budget/rate exhaustion.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_)
            | Error::NotFound(_)
            | Error::InvalidTransition { .. }
            | Error::SessionNotFound(_) => 1,
            Error::Conflict { .. } | Error::SyncInProgress(_) => 3,
            Error::RateLimited(_) | Error::BudgetExhausted(_) | Error::AiUnavailable { .. } => 4,
            _ => 2,
        }
    }

    /// Whether the RPC transport may retry after this failure.
    /// Protocol errors, cancellation, and local contract violations are final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Offline | Error::Timeout | Error::Network(_) | Error::RateLimited(_)
        )
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type Result<T> = std::result::Result<T, Error>;

// ── Tests ──────────────────────────────────────────────────────────────────
