// ── Memoro Core: Local Store ───────────────────────────────────────────────
// Durable SQLite repository for tasks, the offline sync queue, the event
// replay log, provider state, and the AI response cache.
//
// Module layout:
//   tasks      — task CRUD, repository scoping, filter queries
//   queue      — offline SyncOperation queue (FIFO, capped, compacted)
//   events     — per-topic replay log with retention pruning
//   chunks     — memory chunk rows behind the server's memory_* methods
//   providers  — provider config + probe status persistence
//   cache      — AI response cache rows (TTL + LRU eviction)

use crate::error::Result;
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

mod cache;
mod chunks;
mod events;
mod providers;
mod queue;
mod schema;
mod tasks;

pub use chunks::ChunkRow;
pub use tasks::TaskFilter;

/// Thread-safe database wrapper. One connection, WAL mode, guarded by a
/// parking_lot mutex — writers are short and the store is read-heavy.
pub struct TaskStore {
    pub(crate) conn: Mutex<Connection>,
}

impl TaskStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        info!("[store] Opening task store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(TaskStore { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();
        schema::run_migrations(&conn)?;
        Ok(TaskStore { conn: Mutex::new(conn) })
    }
}
