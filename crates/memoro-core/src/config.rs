// ── Memoro Core: Configuration ─────────────────────────────────────────────
// Every tunable (pool sizes, timeouts, thresholds) lives in a config struct
// injected at component construction — there is no process-wide singleton.
// A single `Config::load()` call at startup reads the TOML file, applies
// environment overrides, and the assembly step hands each component its
// section.

use crate::error::Result;
use crate::types::ResolutionStrategy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ── RPC transport ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
}

fn default_max_attempts() -> u32 { 4 }
fn default_base_delay_ms() -> u64 { 100 }
fn default_max_delay_ms() -> u64 { 5_000 }
fn default_multiplier() -> u32 { 2 }

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Sliding window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Initial open-state cooldown in seconds. Doubles on each failed probe.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Ceiling for the doubling cooldown.
    #[serde(default = "default_cooldown_ceiling_secs")]
    pub cooldown_ceiling_secs: u64,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_window_secs() -> u64 { 60 }
fn default_cooldown_secs() -> u64 { 30 }
fn default_cooldown_ceiling_secs() -> u64 { 300 }

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
            cooldown_ceiling_secs: default_cooldown_ceiling_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_capacity")]
    pub capacity: usize,
}

fn default_pool_capacity() -> usize { 8 }

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig { capacity: default_pool_capacity() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_probe_interval_secs() -> u64 { 30 }

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig { probe_interval_secs: default_probe_interval_secs() }
    }
}

// ── Event bus ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Undelivered events a subscriber may lag before its oldest are dropped.
    #[serde(default = "default_lag_threshold")]
    pub lag_threshold: usize,
    /// Persisted-event retention in hours. 0 disables persistence.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_lag_threshold() -> usize { 1000 }
fn default_retention_hours() -> u64 { 24 }

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            lag_threshold: default_lag_threshold(),
            retention_hours: default_retention_hours(),
        }
    }
}

// ── WebSocket hub ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_ping_period_secs")]
    pub ping_period_secs: u64,
    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,
    #[serde(default = "default_write_deadline_secs")]
    pub write_deadline_secs: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Minimum client version accepted at upgrade.
    #[serde(default = "default_min_client_version")]
    pub min_client_version: u32,
}

fn default_ping_period_secs() -> u64 { 54 }
fn default_pong_wait_secs() -> u64 { 60 }
fn default_write_deadline_secs() -> u64 { 10 }
fn default_send_queue_capacity() -> usize { 256 }
fn default_max_message_bytes() -> usize { 512 * 1024 }
fn default_min_client_version() -> u32 { 1 }

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            ping_period_secs: default_ping_period_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            write_deadline_secs: default_write_deadline_secs(),
            send_queue_capacity: default_send_queue_capacity(),
            max_message_bytes: default_max_message_bytes(),
            min_client_version: default_min_client_version(),
        }
    }
}

// ── Push registry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default = "default_push_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_push_retry_max_secs")]
    pub retry_max_secs: u64,
    #[serde(default = "default_push_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_push_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Endpoints whose EWMA health score falls below this are deregistered.
    #[serde(default = "default_push_score_threshold")]
    pub score_threshold: f64,
    /// WebSocket/push duplicate-suppression window in seconds.
    #[serde(default = "default_push_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

fn default_push_retry_base_secs() -> u64 { 1 }
fn default_push_retry_max_secs() -> u64 { 60 }
fn default_push_max_attempts() -> u32 { 5 }
fn default_push_probe_timeout_secs() -> u64 { 2 }
fn default_push_score_threshold() -> f64 { 0.2 }
fn default_push_dedup_window_secs() -> u64 { 5 }

impl Default for PushConfig {
    fn default() -> Self {
        PushConfig {
            retry_base_secs: default_push_retry_base_secs(),
            retry_max_secs: default_push_retry_max_secs(),
            max_attempts: default_push_max_attempts(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_push_probe_timeout_secs(),
            score_threshold: default_push_score_threshold(),
            dedup_window_secs: default_push_dedup_window_secs(),
        }
    }
}

// ── Sync engine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Offline queue hard cap; overflow evicts the oldest entry.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Periodic full-sync interval in seconds.
    #[serde(default = "default_sync_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_strategy")]
    pub strategy: ResolutionStrategy,
    /// Acknowledged queue rows triggering a compaction pass.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: usize,
}

fn default_queue_capacity() -> usize { 1000 }
fn default_sync_tick_secs() -> u64 { 300 }
fn default_strategy() -> ResolutionStrategy { ResolutionStrategy::LastWriteWins }
fn default_compaction_threshold() -> usize { 256 }

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            queue_capacity: default_queue_capacity(),
            tick_secs: default_sync_tick_secs(),
            strategy: default_strategy(),
            compaction_threshold: default_compaction_threshold(),
        }
    }
}

// ── AI router ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// TTL for `analyze` responses in seconds.
    #[serde(default = "default_analyze_ttl_secs")]
    pub analyze_ttl_secs: u64,
    /// TTL for `complexity` responses in seconds.
    #[serde(default = "default_complexity_ttl_secs")]
    pub complexity_ttl_secs: u64,
    /// TTL for document-generation responses in seconds.
    #[serde(default = "default_generate_ttl_secs")]
    pub generate_ttl_secs: u64,
    #[serde(default = "default_daily_budget_usd")]
    pub daily_budget_usd: f64,
    #[serde(default = "default_monthly_budget_usd")]
    pub monthly_budget_usd: f64,
    /// Operation-name → provider-id pins consulted before priority order.
    #[serde(default)]
    pub operation_overrides: std::collections::HashMap<String, String>,
}

fn default_cache_capacity() -> usize { 512 }
fn default_analyze_ttl_secs() -> u64 { 3600 }
fn default_complexity_ttl_secs() -> u64 { 24 * 3600 }
fn default_generate_ttl_secs() -> u64 { 3600 }
fn default_daily_budget_usd() -> f64 { 25.0 }
fn default_monthly_budget_usd() -> f64 { 250.0 }

impl Default for AiConfig {
    fn default() -> Self {
        AiConfig {
            cache_capacity: default_cache_capacity(),
            analyze_ttl_secs: default_analyze_ttl_secs(),
            complexity_ttl_secs: default_complexity_ttl_secs(),
            generate_ttl_secs: default_generate_ttl_secs(),
            daily_budget_usd: default_daily_budget_usd(),
            monthly_budget_usd: default_monthly_budget_usd(),
            operation_overrides: Default::default(),
        }
    }
}

// ── Top-level config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Memory Protocol Server base URL, e.g. "http://127.0.0.1:7737".
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Protocol version advertised at WebSocket upgrade.
    #[serde(default = "default_client_version")]
    pub client_version: u32,
    /// Data directory for the local SQLite store. `None` = platform default.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub ai: AiConfig,
    /// Provider definitions; credentials are env-var references only.
    #[serde(default)]
    pub providers: Vec<crate::types::ProviderConfig>,
}

fn default_server_url() -> String {
    "http://127.0.0.1:7737".into()
}

fn default_client_version() -> u32 { 1 }

impl Config {
    /// Load from a TOML file, then apply environment overrides
    /// (`MEMORY_SERVER_URL`, `CLIENT_VERSION`). A missing file yields
    /// defaults so first runs need no setup.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw)
                    .map_err(|e| crate::error::Error::validation(format!("config parse: {}", e)))?
            }
            _ => Config { server_url: default_server_url(), client_version: default_client_version(), ..Config::default() },
        };

        if let Ok(url) = std::env::var("MEMORY_SERVER_URL") {
            if !url.is_empty() {
                config.server_url = url;
            }
        }
        if let Ok(v) = std::env::var("CLIENT_VERSION") {
            if let Ok(parsed) = v.parse::<u32>() {
                config.client_version = parsed;
            }
        }
        Ok(config)
    }

    /// Resolve the SQLite database path, creating the data directory.
    pub fn db_path(&self) -> Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(d) => d.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("memoro"),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join("memoro.db"))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 4);
        assert_eq!(retry.base_delay(), Duration::from_millis(100));
        assert_eq!(retry.max_delay(), Duration::from_secs(5));
        assert_eq!(retry.multiplier, 2);

        let breaker = BreakerConfig::default();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.window_secs, 60);
        assert_eq!(breaker.cooldown_secs, 30);

        let hub = HubConfig::default();
        assert_eq!(hub.ping_period_secs, 54);
        assert_eq!(hub.pong_wait_secs, 60);
        assert_eq!(hub.write_deadline_secs, 10);
        assert_eq!(hub.send_queue_capacity, 256);
        assert_eq!(hub.max_message_bytes, 512 * 1024);

        let push = PushConfig::default();
        assert_eq!(push.retry_base_secs, 1);
        assert_eq!(push.retry_max_secs, 60);
        assert_eq!(push.max_attempts, 5);
        assert!((push.score_threshold - 0.2).abs() < f64::EPSILON);

        let sync = SyncConfig::default();
        assert_eq!(sync.queue_capacity, 1000);
        assert_eq!(sync.tick_secs, 300);
        assert_eq!(sync.strategy, ResolutionStrategy::LastWriteWins);

        let bus = BusConfig::default();
        assert_eq!(bus.lag_threshold, 1000);
        assert_eq!(bus.retention_hours, 24);
    }

    #[test]
    fn toml_partial_sections_fill_with_defaults() {
        let raw = r#"
            server_url = "http://example.test:9000"

            [retry]
            max_attempts = 7

            [sync]
            strategy = "merge"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server_url, "http://example.test:9000");
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.sync.strategy, ResolutionStrategy::Merge);
        assert_eq!(config.sync.queue_capacity, 1000);
    }
}
