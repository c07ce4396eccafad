// Response cache keyed by request fingerprint. TTL is per operation;
// interactive session steps are never cached. Rows live in the store's
// ai_cache table with size-bounded LRU eviction.

use crate::checksum;
use crate::config::AiConfig;
use crate::error::Result;
use crate::store::TaskStore;
use crate::types::{AiOperation, AiRequest, AiResponse, CacheEntry};
use chrono::Utc;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

pub struct AiCache {
    store: Arc<TaskStore>,
    capacity: usize,
    analyze_ttl: Duration,
    complexity_ttl: Duration,
    generate_ttl: Duration,
}

impl AiCache {
    pub fn new(store: Arc<TaskStore>, config: &AiConfig) -> Self {
        AiCache {
            store,
            capacity: config.cache_capacity,
            analyze_ttl: Duration::from_secs(config.analyze_ttl_secs),
            complexity_ttl: Duration::from_secs(config.complexity_ttl_secs),
            generate_ttl: Duration::from_secs(config.generate_ttl_secs),
        }
    }

    /// Cache TTL for an operation; `None` disables caching for it.
    pub fn ttl_for(&self, operation: AiOperation) -> Option<Duration> {
        match operation {
            AiOperation::Analyze => Some(self.analyze_ttl),
            AiOperation::Complexity => Some(self.complexity_ttl),
            AiOperation::PrdGenerate
            | AiOperation::TrdGenerate
            | AiOperation::MainTasks
            | AiOperation::SubTasks => Some(self.generate_ttl),
            AiOperation::SessionStep => None,
        }
    }

    fn fingerprint(request: &AiRequest) -> String {
        checksum::request_fingerprint(
            request.operation.as_str(),
            &request.content,
            request.model_hint.as_deref(),
        )
    }

    /// Cache lookup. A hit comes back flagged and with its count bumped.
    pub fn lookup(&self, request: &AiRequest) -> Result<Option<AiResponse>> {
        if self.ttl_for(request.operation).is_none() {
            return Ok(None);
        }
        let fingerprint = Self::fingerprint(request);
        let Some(entry) = self.store.cache_get(&fingerprint)? else {
            return Ok(None);
        };
        debug!(
            "[ai] Cache hit for {} (hits={})",
            request.operation.as_str(),
            entry.hit_count
        );
        let mut response = entry.response;
        response.cache_hit = true;
        Ok(Some(response))
    }

    /// Store a fresh response under the request's fingerprint.
    pub fn store_response(&self, request: &AiRequest, response: &AiResponse) -> Result<()> {
        let Some(ttl) = self.ttl_for(request.operation) else {
            return Ok(());
        };
        let entry = CacheEntry {
            fingerprint: Self::fingerprint(request),
            response: response.clone(),
            content_digest: checksum::content_digest(&request.content),
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
            hit_count: 0,
        };
        self.store.cache_put(&entry, self.capacity)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> AiCache {
        AiCache::new(Arc::new(TaskStore::open_in_memory().unwrap()), &AiConfig::default())
    }

    fn response(model: &str) -> AiResponse {
        AiResponse {
            id: "r1".into(),
            content: "generated".into(),
            model_used: model.into(),
            tokens_in: 5,
            tokens_out: 10,
            latency_ms: 3,
            cache_hit: false,
        }
    }

    #[test]
    fn round_trip_marks_cache_hit() {
        let cache = cache();
        let request = AiRequest::new(AiOperation::Analyze, "examine this code");
        assert!(cache.lookup(&request).unwrap().is_none());

        cache.store_response(&request, &response("m1")).unwrap();
        let hit = cache.lookup(&request).unwrap().unwrap();
        assert!(hit.cache_hit);
        assert_eq!(hit.model_used, "m1");
    }

    #[test]
    fn normalized_content_shares_fingerprint() {
        let cache = cache();
        let request = AiRequest::new(AiOperation::Analyze, "Examine   THIS code");
        cache.store_response(&request, &response("m1")).unwrap();

        let normalized = AiRequest::new(AiOperation::Analyze, "examine this code");
        assert!(cache.lookup(&normalized).unwrap().is_some());
    }

    #[test]
    fn session_steps_are_never_cached() {
        let cache = cache();
        let request = AiRequest::new(AiOperation::SessionStep, "continue");
        cache.store_response(&request, &response("m1")).unwrap();
        assert!(cache.lookup(&request).unwrap().is_none());
    }

    #[test]
    fn model_hint_partitions_the_cache() {
        let cache = cache();
        let mut hinted = AiRequest::new(AiOperation::Analyze, "content");
        hinted.model_hint = Some("m-special".into());
        cache.store_response(&hinted, &response("m-special")).unwrap();

        let unhinted = AiRequest::new(AiOperation::Analyze, "content");
        assert!(cache.lookup(&unhinted).unwrap().is_none());
        assert!(cache.lookup(&hinted).unwrap().is_some());
    }
}
