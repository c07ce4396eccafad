// Offline sync queue persistence. Entries are append-only and FIFO by rowid;
// the hard cap evicts the oldest pending entry. Acknowledged rows stay until
// a compaction pass removes them, which keeps the queue crash-consistent —
// an operation is either pending, acked, or compacted away, never lost.

use super::TaskStore;
use crate::error::Result;
use crate::types::{SyncOpKind, SyncOperation, Task};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::params;

impl TaskStore {
    /// Append an operation scoped to `repository`. When the pending count for
    /// that repository is at `capacity`, the oldest pending entry is evicted
    /// first.
    pub fn enqueue_op(&self, repository: &str, op: &SyncOperation, capacity: usize) -> Result<()> {
        let conn = self.conn.lock();
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_operations WHERE acked = 0 AND repository = ?1",
            params![repository],
            |r| r.get(0),
        )?;
        if pending as usize >= capacity {
            warn!(
                "[store] Offline queue for '{}' at capacity ({}) — evicting oldest entry",
                repository, capacity
            );
            conn.execute(
                "DELETE FROM sync_operations WHERE rowid =
                   (SELECT MIN(rowid) FROM sync_operations WHERE acked = 0 AND repository = ?1)",
                params![repository],
            )?;
        }
        let snapshot = match &op.task_snapshot {
            Some(task) => Some(serde_json::to_string(task)?),
            None => None,
        };
        conn.execute(
            "INSERT INTO sync_operations
                 (operation_id, repository, kind, task_id, task_snapshot, timestamp, retry_count, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                op.operation_id,
                repository,
                op.kind.as_str(),
                op.task_id,
                snapshot,
                op.timestamp.to_rfc3339(),
                op.retry_count,
                op.last_error,
            ],
        )?;
        Ok(())
    }

    /// Pending operations for a repository in FIFO order.
    pub fn pending_ops(&self, repository: &str) -> Result<Vec<SyncOperation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT operation_id, kind, task_id, task_snapshot, timestamp, retry_count, last_error
             FROM sync_operations WHERE acked = 0 AND repository = ?1 ORDER BY rowid",
        )?;
        let ops = stmt
            .query_map(params![repository], |row| {
                let kind: String = row.get(1)?;
                let snapshot: Option<String> = row.get(3)?;
                let ts: String = row.get(4)?;
                Ok(SyncOperation {
                    operation_id: row.get(0)?,
                    kind: SyncOpKind::parse(&kind).unwrap_or(SyncOpKind::Update),
                    task_id: row.get(2)?,
                    task_snapshot: snapshot
                        .and_then(|s| serde_json::from_str::<Task>(&s).ok()),
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    retry_count: row.get(5)?,
                    last_error: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ops)
    }

    pub fn pending_op_count(&self, repository: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_operations WHERE acked = 0 AND repository = ?1",
            params![repository],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Task ids with a pending delete operation — a remote copy of one of
    /// these must not be resurrected by a pull.
    pub fn pending_delete_ids(&self, repository: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id FROM sync_operations
             WHERE acked = 0 AND repository = ?1 AND kind = 'delete'",
        )?;
        let ids = stmt
            .query_map(params![repository], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Record a failed attempt against a queue entry.
    pub fn record_op_failure(&self, operation_id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sync_operations SET retry_count = retry_count + 1, last_error = ?2
             WHERE operation_id = ?1",
            params![operation_id, error],
        )?;
        Ok(())
    }

    /// Mark an operation acknowledged by the remote. The row survives until
    /// compaction.
    pub fn ack_op(&self, operation_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sync_operations SET acked = 1 WHERE operation_id = ?1",
            params![operation_id],
        )?;
        Ok(())
    }

    /// Remove acknowledged rows once they exceed `threshold`.
    /// Returns the number of rows compacted.
    pub fn compact_ops(&self, threshold: usize) -> Result<usize> {
        let conn = self.conn.lock();
        let acked: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_operations WHERE acked = 1",
            [],
            |r| r.get(0),
        )?;
        if (acked as usize) < threshold {
            return Ok(0);
        }
        let removed = conn.execute("DELETE FROM sync_operations WHERE acked = 1", [])?;
        debug!("[store] Compacted {} acknowledged sync operations", removed);
        Ok(removed)
    }

    // ── Per-repository sync state ──────────────────────────────────────

    pub fn sync_token(&self, repository: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let token = conn
            .query_row(
                "SELECT last_sync_token FROM sync_state WHERE repository = ?1",
                params![repository],
                |r| r.get::<_, Option<String>>(0),
            )
            .unwrap_or(None);
        Ok(token)
    }

    /// Completion time of the last successful sync — the common ancestor
    /// time for conflict detection.
    pub fn last_sync_time(&self, repository: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let time: Option<String> = conn
            .query_row(
                "SELECT last_sync_time FROM sync_state WHERE repository = ?1",
                params![repository],
                |r| r.get(0),
            )
            .unwrap_or(None);
        Ok(time.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .ok()
        }))
    }

    pub fn set_sync_token(&self, repository: &str, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_state (repository, last_sync_token, last_sync_time)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(repository) DO UPDATE SET
                 last_sync_token = excluded.last_sync_token,
                 last_sync_time = excluded.last_sync_time",
            params![repository, token, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
