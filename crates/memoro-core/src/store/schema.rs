// Database schema and migrations for the Memoro store.
// Called once at startup by TaskStore::open() after WAL is enabled.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT
// EXISTS or ALTER TABLE … ADD COLUMN at the end of run_migrations() — never
// modify existing SQL to keep upgrade paths clean.

use crate::error::Result;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            repository TEXT NOT NULL,
            content TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority TEXT NOT NULL DEFAULT 'medium',
            tags TEXT NOT NULL DEFAULT '[]',
            estimated_minutes INTEGER NOT NULL DEFAULT 0,
            actual_minutes INTEGER NOT NULL DEFAULT 0,
            parent_task_id TEXT,
            session_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            checksum TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            deleted INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_repository ON tasks(repository, updated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);

        CREATE TABLE IF NOT EXISTS task_activity (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            source TEXT,
            content TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_task_activity_task
            ON task_activity(task_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS sync_operations (
            operation_id TEXT PRIMARY KEY,
            repository TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL,
            task_id TEXT NOT NULL,
            task_snapshot TEXT,
            timestamp TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            acked INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS sync_state (
            repository TEXT PRIMARY KEY,
            last_sync_token TEXT,
            last_sync_time TEXT
        );

        CREATE TABLE IF NOT EXISTS events (
            topic TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            repository TEXT,
            payload TEXT NOT NULL DEFAULT '{}',
            request_id TEXT,
            timestamp TEXT NOT NULL,
            PRIMARY KEY (topic, sequence)
        );

        CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);

        CREATE TABLE IF NOT EXISTS memory_chunks (
            chunk_id TEXT PRIMARY KEY,
            repository TEXT NOT NULL,
            content TEXT NOT NULL,
            chunk_type TEXT NOT NULL DEFAULT 'chunk',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_repository ON memory_chunks(repository);

        CREATE TABLE IF NOT EXISTS providers (
            id TEXT PRIMARY KEY,
            config TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'healthy',
            last_probe_time TEXT
        );

        CREATE TABLE IF NOT EXISTS ai_cache (
            fingerprint TEXT PRIMARY KEY,
            response TEXT NOT NULL,
            content_digest TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 0,
            last_used_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ai_cache_digest ON ai_cache(content_digest);
        ",
    )?;
    Ok(())
}
