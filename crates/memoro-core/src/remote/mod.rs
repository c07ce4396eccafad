// ── Memoro Core: Remote Memory Client ──────────────────────────────────────
// Typed Memory Protocol operations over the resilient RPC layer. Handles are
// drawn from the bounded connection pool; online/offline state is tracked
// passively from call outcomes on top of the background health probe.
//
// Wire methods (§ Memory Protocol):
//   memory_create  — store_chunk | store_decision
//   memory_read    — search | find_similar | get_chunk
//   memory_update  — update_thread
//   memory_tasks   — todo_read | todo_write | todo_update
//   memory_system  — health

use crate::config::{BreakerConfig, PoolConfig, RetryConfig};
use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::rpc::{CircuitBreaker, ConnectionPool, OnlineState, PoolMetrics, RpcTransport};
use crate::types::Task;
use log::debug;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Result of a delta pull: remote tasks changed since the cursor plus the
/// next opaque cursor.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteChanges {
    #[serde(default)]
    pub tasks: Vec<Task>,
    pub sync_token: String,
}

/// A stored memory chunk as returned by `memory_read`.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryChunk {
    pub chunk_id: String,
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub struct RemoteMemoryClient {
    pool: ConnectionPool<Arc<RpcTransport>>,
    online: Arc<OnlineState>,
}

impl RemoteMemoryClient {
    /// Build a client for `endpoint` (the full `/mcp` URL). All pooled
    /// handles share one circuit breaker so the endpoint trips as a unit.
    pub fn new(
        endpoint: impl Into<String>,
        retry: RetryConfig,
        breaker: BreakerConfig,
        pool: PoolConfig,
        online: Arc<OnlineState>,
    ) -> Self {
        let endpoint = endpoint.into();
        let shared_breaker = Arc::new(CircuitBreaker::new(breaker));
        let pool = ConnectionPool::new(pool.capacity, move || {
            Arc::new(RpcTransport::with_shared_breaker(
                endpoint.clone(),
                retry.clone(),
                Arc::clone(&shared_breaker),
            ))
        });
        RemoteMemoryClient { pool, online }
    }

    pub fn is_offline(&self) -> bool {
        !self.online.is_online()
    }

    pub fn pool_metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    /// Route one call through a pooled transport, folding the outcome into
    /// the shared online state.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        ctx: &Ctx,
    ) -> Result<serde_json::Value> {
        let handle = self.pool.acquire(ctx).await?;
        let result = handle.call(method, params, ctx).await;
        match &result {
            Ok(_) | Err(Error::Protocol { .. }) => {
                self.online.set(true);
            }
            Err(Error::Offline) | Err(Error::Timeout) => {
                if self.online.set(false) {
                    debug!("[remote] Marking client offline after failed call");
                }
            }
            _ => {}
        }
        result
    }

    // ── Task operations ────────────────────────────────────────────────

    /// Push a newly created task.
    pub async fn push_create(&self, task: &Task, ctx: &Ctx) -> Result<()> {
        self.call(
            "memory_tasks",
            json!({"operation": "todo_write", "options": {"task": task}}),
            ctx,
        )
        .await
        .map(|_| ())
    }

    /// Push an updated task snapshot.
    pub async fn push_update(&self, task: &Task, ctx: &Ctx) -> Result<()> {
        self.call(
            "memory_tasks",
            json!({"operation": "todo_update", "options": {"task": task}}),
            ctx,
        )
        .await
        .map(|_| ())
    }

    /// Push a task deletion.
    pub async fn push_delete(&self, task_id: &str, ctx: &Ctx) -> Result<()> {
        self.call(
            "memory_tasks",
            json!({"operation": "todo_update", "options": {"task_id": task_id, "deleted": true}}),
            ctx,
        )
        .await
        .map(|_| ())
    }

    /// Pull remote changes since the opaque cursor. `None` means a full read.
    pub async fn pull_changes(
        &self,
        repository: &str,
        since_token: Option<&str>,
        ctx: &Ctx,
    ) -> Result<RemoteChanges> {
        let result = self
            .call(
                "memory_tasks",
                json!({
                    "operation": "todo_read",
                    "options": {"repository": repository, "since_token": since_token},
                }),
                ctx,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    // ── Memory chunk operations ────────────────────────────────────────

    pub async fn store_chunk(
        &self,
        repository: &str,
        content: &str,
        chunk_type: &str,
        metadata: serde_json::Value,
        ctx: &Ctx,
    ) -> Result<String> {
        let result = self
            .call(
                "memory_create",
                json!({
                    "operation": "store_chunk",
                    "options": {
                        "repository": repository,
                        "content": content,
                        "type": chunk_type,
                        "metadata": metadata,
                    },
                }),
                ctx,
            )
            .await?;
        Ok(result["chunk_id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn store_decision(
        &self,
        repository: &str,
        content: &str,
        metadata: serde_json::Value,
        ctx: &Ctx,
    ) -> Result<String> {
        let result = self
            .call(
                "memory_create",
                json!({
                    "operation": "store_decision",
                    "options": {"repository": repository, "content": content, "metadata": metadata},
                }),
                ctx,
            )
            .await?;
        Ok(result["chunk_id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn search(
        &self,
        repository: &str,
        query: &str,
        limit: u32,
        ctx: &Ctx,
    ) -> Result<Vec<MemoryChunk>> {
        let result = self
            .call(
                "memory_read",
                json!({
                    "operation": "search",
                    "options": {"repository": repository, "query": query, "limit": limit},
                }),
                ctx,
            )
            .await?;
        Ok(serde_json::from_value(result["chunks"].clone()).unwrap_or_default())
    }

    pub async fn find_similar(
        &self,
        repository: &str,
        content: &str,
        limit: u32,
        ctx: &Ctx,
    ) -> Result<Vec<MemoryChunk>> {
        let result = self
            .call(
                "memory_read",
                json!({
                    "operation": "find_similar",
                    "options": {"repository": repository, "query": content, "limit": limit},
                }),
                ctx,
            )
            .await?;
        Ok(serde_json::from_value(result["chunks"].clone()).unwrap_or_default())
    }

    pub async fn get_chunk(&self, chunk_id: &str, ctx: &Ctx) -> Result<MemoryChunk> {
        let result = self
            .call(
                "memory_read",
                json!({"operation": "get_chunk", "options": {"chunk_id": chunk_id}}),
                ctx,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn update_thread(
        &self,
        thread_id: &str,
        metadata: serde_json::Value,
        ctx: &Ctx,
    ) -> Result<()> {
        self.call(
            "memory_update",
            json!({
                "operation": "update_thread",
                "options": {"thread_id": thread_id, "metadata": metadata},
            }),
            ctx,
        )
        .await
        .map(|_| ())
    }

    pub async fn health(&self, ctx: &Ctx) -> Result<()> {
        self.call(
            "memory_system",
            json!({"operation": "health", "options": {}}),
            ctx,
        )
        .await
        .map(|_| ())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(online: Arc<OnlineState>) -> RemoteMemoryClient {
        RemoteMemoryClient::new(
            "http://127.0.0.1:1/mcp",
            RetryConfig { max_attempts: 1, base_delay_ms: 1, max_delay_ms: 2, multiplier: 2 },
            BreakerConfig::default(),
            PoolConfig { capacity: 2 },
            online,
        )
    }

    #[tokio::test]
    async fn failed_call_marks_client_offline() {
        let online = Arc::new(OnlineState::new());
        online.set(true);
        let client = client(Arc::clone(&online));
        let ctx = Ctx::with_timeout(Duration::from_secs(2));
        let err = client.health(&ctx).await.unwrap_err();
        assert!(matches!(err.kind(), "offline" | "timeout"));
        assert!(client.is_offline());
    }

    #[test]
    fn remote_changes_deserializes_wire_shape() {
        let raw = serde_json::json!({
            "tasks": [],
            "sync_token": "cursor-42",
        });
        let changes: RemoteChanges = serde_json::from_value(raw).unwrap();
        assert!(changes.tasks.is_empty());
        assert_eq!(changes.sync_token, "cursor-42");
    }
}
