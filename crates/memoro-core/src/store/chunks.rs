// Memory chunk rows behind the server's memory_create/memory_read methods.
// The real vector index is an external, opaque store; this table carries the
// canonical text and metadata, and search falls back to substring matching
// so the protocol surface works without the index attached.

use super::TaskStore;
use crate::error::{Error, Result};
use rusqlite::params;

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub repository: String,
    pub content: String,
    pub chunk_type: String,
    pub metadata: serde_json::Value,
}

impl TaskStore {
    pub fn insert_chunk(
        &self,
        repository: &str,
        content: &str,
        chunk_type: &str,
        metadata: &serde_json::Value,
    ) -> Result<String> {
        let chunk_id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_chunks (chunk_id, repository, content, chunk_type, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chunk_id, repository, content, chunk_type, metadata.to_string()],
        )?;
        Ok(chunk_id)
    }

    pub fn get_chunk(&self, chunk_id: &str) -> Result<ChunkRow> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT chunk_id, repository, content, chunk_type, metadata
             FROM memory_chunks WHERE chunk_id = ?1",
            params![chunk_id],
            row_to_chunk,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("chunk {}", chunk_id)),
            other => other.into(),
        })
    }

    /// Substring search within a repository, newest first.
    pub fn search_chunks(&self, repository: &str, query: &str, limit: u32) -> Result<Vec<ChunkRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT chunk_id, repository, content, chunk_type, metadata
             FROM memory_chunks
             WHERE repository = ?1 AND content LIKE '%' || ?2 || '%'
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let chunks = stmt
            .query_map(params![repository, query, limit], row_to_chunk)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(chunks)
    }

    pub fn update_chunk_metadata(&self, chunk_id: &str, metadata: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE memory_chunks SET metadata = ?2 WHERE chunk_id = ?1",
            params![chunk_id, metadata.to_string()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("chunk {}", chunk_id)));
        }
        Ok(())
    }
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    let metadata: String = row.get(4)?;
    Ok(ChunkRow {
        chunk_id: row.get(0)?,
        repository: row.get(1)?,
        content: row.get(2)?,
        chunk_type: row.get(3)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────
