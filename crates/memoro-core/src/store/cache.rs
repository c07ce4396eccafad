// Persisted AI response cache rows. The router's in-memory LRU fronts this
// table; rows expire by TTL and are evicted oldest-used-first when the table
// grows past the configured capacity.

use super::TaskStore;
use crate::error::Result;
use crate::types::{AiResponse, CacheEntry};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::params;

impl TaskStore {
    /// Look up a cache row. Expired rows are deleted on sight. A hit bumps
    /// `hit_count` and the LRU timestamp.
    pub fn cache_get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT response, content_digest, expires_at, hit_count
                 FROM ai_cache WHERE fingerprint = ?1",
                params![fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .map(Some)
            .unwrap_or(None);

        let Some((response, content_digest, expires_at, hit_count)) = row else {
            return Ok(None);
        };
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        if expires_at <= Utc::now() {
            conn.execute("DELETE FROM ai_cache WHERE fingerprint = ?1", params![fingerprint])?;
            return Ok(None);
        }

        let response: AiResponse = serde_json::from_str(&response)?;
        let hit_count = hit_count as u64 + 1;
        conn.execute(
            "UPDATE ai_cache SET hit_count = ?2, last_used_at = ?3 WHERE fingerprint = ?1",
            params![fingerprint, hit_count as i64, Utc::now().to_rfc3339()],
        )?;

        Ok(Some(CacheEntry {
            fingerprint: fingerprint.into(),
            response,
            content_digest,
            expires_at,
            hit_count,
        }))
    }

    /// Insert or refresh a cache row, then evict beyond `capacity`
    /// (least-recently-used first).
    pub fn cache_put(&self, entry: &CacheEntry, capacity: usize) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO ai_cache
                 (fingerprint, response, content_digest, expires_at, hit_count, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.fingerprint,
                serde_json::to_string(&entry.response)?,
                entry.content_digest,
                entry.expires_at.to_rfc3339(),
                entry.hit_count as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let evicted = conn.execute(
            "DELETE FROM ai_cache WHERE fingerprint IN (
                 SELECT fingerprint FROM ai_cache
                 ORDER BY last_used_at DESC
                 LIMIT -1 OFFSET ?1)",
            params![capacity as i64],
        )?;
        if evicted > 0 {
            debug!("[store] Evicted {} cache rows past capacity {}", evicted, capacity);
        }
        Ok(())
    }

    /// Remove every cache row derived from the given content digest — called
    /// by the sync engine when a resolved snapshot replaces local content.
    pub fn cache_invalidate_digest(&self, content_digest: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM ai_cache WHERE content_digest = ?1",
            params![content_digest],
        )?;
        Ok(removed)
    }

    pub fn cache_purge_expired(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM ai_cache WHERE expires_at <= ?1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(removed)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;

    fn entry(fingerprint: &str, content: &str, ttl_secs: i64) -> CacheEntry {
        CacheEntry {
            fingerprint: fingerprint.into(),
            response: AiResponse {
                id: "r1".into(),
                content: "generated".into(),
                model_used: "m1".into(),
                tokens_in: 10,
                tokens_out: 20,
                latency_ms: 5,
                cache_hit: false,
            },
            content_digest: checksum::content_digest(content),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
            hit_count: 0,
        }
    }

    #[test]
    fn hit_bumps_count() {
        let store = TaskStore::open_in_memory().unwrap();
        store.cache_put(&entry("f1", "text", 3600), 100).unwrap();
        let first = store.cache_get("f1").unwrap().unwrap();
        assert_eq!(first.hit_count, 1);
        let second = store.cache_get("f1").unwrap().unwrap();
        assert_eq!(second.hit_count, 2);
    }

    #[test]
    fn expired_rows_vanish() {
        let store = TaskStore::open_in_memory().unwrap();
        store.cache_put(&entry("f1", "text", -10), 100).unwrap();
        assert!(store.cache_get("f1").unwrap().is_none());
    }

    #[test]
    fn digest_invalidation_removes_derived_rows() {
        let store = TaskStore::open_in_memory().unwrap();
        store.cache_put(&entry("f1", "fix the auth bug", 3600), 100).unwrap();
        store.cache_put(&entry("f2", "fix the auth bug", 3600), 100).unwrap();
        store.cache_put(&entry("f3", "unrelated", 3600), 100).unwrap();

        let removed = store
            .cache_invalidate_digest(&checksum::content_digest("fix the auth bug"))
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.cache_get("f3").unwrap().is_some());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let store = TaskStore::open_in_memory().unwrap();
        store.cache_put(&entry("f1", "a", 3600), 10).unwrap();
        store.cache_put(&entry("f2", "b", 3600), 10).unwrap();
        // Touch f1 so f2 becomes the LRU row
        store.cache_get("f1").unwrap();
        store.cache_put(&entry("f3", "c", 3600), 2).unwrap();

        assert!(store.cache_get("f2").unwrap().is_none());
        assert!(store.cache_get("f1").unwrap().is_some());
        assert!(store.cache_get("f3").unwrap().is_some());
    }
}
