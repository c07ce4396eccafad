// Provider config and probe status persistence. Config rows hold the full
// serialized ProviderConfig; credentials stay in the environment (auth_ref
// names the variable, the value never touches the database).

use super::TaskStore;
use crate::error::Result;
use crate::types::{ProviderConfig, ProviderStatus};
use chrono::Utc;
use rusqlite::params;

fn status_str(status: ProviderStatus) -> &'static str {
    match status {
        ProviderStatus::Healthy => "healthy",
        ProviderStatus::Degraded => "degraded",
        ProviderStatus::Unhealthy => "unhealthy",
    }
}

fn parse_status(s: &str) -> ProviderStatus {
    match s {
        "degraded" => ProviderStatus::Degraded,
        "unhealthy" => ProviderStatus::Unhealthy,
        _ => ProviderStatus::Healthy,
    }
}

impl TaskStore {
    pub fn upsert_provider(&self, config: &ProviderConfig) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO providers (id, config, status) VALUES (?1, ?2, 'healthy')
             ON CONFLICT(id) DO UPDATE SET config = excluded.config",
            params![config.id, serde_json::to_string(config)?],
        )?;
        Ok(())
    }

    pub fn list_providers(&self) -> Result<Vec<(ProviderConfig, ProviderStatus)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT config, status FROM providers")?;
        let providers = stmt
            .query_map([], |row| {
                let config: String = row.get(0)?;
                let status: String = row.get(1)?;
                Ok((config, status))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(config, status)| {
                serde_json::from_str::<ProviderConfig>(&config)
                    .ok()
                    .map(|c| (c, parse_status(&status)))
            })
            .collect();
        Ok(providers)
    }

    pub fn set_provider_status(&self, id: &str, status: ProviderStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE providers SET status = ?2, last_probe_time = ?3 WHERE id = ?1",
            params![id, status_str(status), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AiOperation, ProviderKind, RateLimitConfig};

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            kind: ProviderKind::Anthropic,
            endpoint: "http://127.0.0.1:9999".into(),
            auth_ref: Some("TEST_API_KEY".into()),
            supported_operations: vec![AiOperation::Analyze],
            priority: 1,
            rate_limit: RateLimitConfig { rpm: 60, burst: 5 },
            model: "test-model".into(),
        }
    }

    #[test]
    fn upsert_and_status_round_trip() {
        let store = TaskStore::open_in_memory().unwrap();
        store.upsert_provider(&provider("p1")).unwrap();
        store.upsert_provider(&provider("p1")).unwrap(); // idempotent
        store.set_provider_status("p1", ProviderStatus::Degraded).unwrap();

        let providers = store.list_providers().unwrap();
        assert_eq!(providers.len(), 1);
        let (config, status) = &providers[0];
        assert_eq!(config.id, "p1");
        assert_eq!(*status, ProviderStatus::Degraded);
    }
}
