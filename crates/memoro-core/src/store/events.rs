// Event replay log. The bus assigns per-topic sequences; the store persists
// them so reconnecting subscribers can replay from a cursor. Retention
// pruning runs periodically from the bus's maintenance task.

use super::TaskStore;
use crate::error::Result;
use crate::types::{Event, EventType};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::params;

impl TaskStore {
    pub fn append_event(&self, event: &Event) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO events
                 (topic, sequence, event_type, repository, payload, request_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.topic,
                event.sequence as i64,
                event.event_type.as_str(),
                event.repository,
                serde_json::to_string(&event.payload)?,
                event.request_id,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Persisted events on `topic` with sequence strictly greater than
    /// `since`, in sequence order.
    pub fn events_since(&self, topic: &str, since: u64, limit: u32) -> Result<Vec<Event>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT topic, sequence, event_type, repository, payload, request_id, timestamp
             FROM events WHERE topic = ?1 AND sequence > ?2
             ORDER BY sequence LIMIT ?3",
        )?;
        let events = stmt
            .query_map(params![topic, since as i64, limit], |row| {
                let event_type: String = row.get(2)?;
                let payload: String = row.get(4)?;
                let ts: String = row.get(6)?;
                Ok(Event {
                    topic: row.get(0)?,
                    sequence: row.get::<_, i64>(1)? as u64,
                    event_type: EventType::parse(&event_type).unwrap_or(EventType::System),
                    repository: row.get(3)?,
                    payload: serde_json::from_str(&payload).unwrap_or_default(),
                    request_id: row.get(5)?,
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    /// Highest persisted sequence per topic, used to seed the bus counters
    /// after a restart.
    pub fn max_event_sequence(&self, topic: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(sequence) FROM events WHERE topic = ?1",
                params![topic],
                |r| r.get(0),
            )
            .unwrap_or(None);
        Ok(max.unwrap_or(0) as u64)
    }

    /// Drop events older than `cutoff`. Returns the number removed.
    pub fn prune_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM events WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        if removed > 0 {
            debug!("[store] Pruned {} expired events", removed);
        }
        Ok(removed)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
