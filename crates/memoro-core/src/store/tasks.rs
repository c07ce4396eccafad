// Task rows: CRUD, repository-scoped filter queries, and the activity trail.
// Deletes are tombstones while a delete operation waits in the offline queue;
// the row is removed for real once the remote acknowledges.

use super::TaskStore;
use crate::error::{Error, Result};
use crate::types::{Task, TaskPriority, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue};

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl Task {
    /// Map a row with columns (id, repository, content, status, priority,
    /// tags, estimated_minutes, actual_minutes, parent_task_id, session_id,
    /// created_at, updated_at, completed_at, checksum, metadata) → Task.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(3)?;
        let priority: String = row.get(4)?;
        let tags: String = row.get(5)?;
        let metadata: String = row.get(14)?;
        let completed_at: Option<String> = row.get(12)?;
        Ok(Task {
            id: row.get(0)?,
            repository: row.get(1)?,
            content: row.get(2)?,
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
            priority: TaskPriority::parse(&priority).unwrap_or(TaskPriority::Medium),
            tags: serde_json::from_str(&tags).unwrap_or_default(),
            estimated_minutes: row.get(6)?,
            actual_minutes: row.get(7)?,
            parent_task_id: row.get(8)?,
            session_id: row.get(9)?,
            created_at: parse_ts(10, row.get(10)?)?,
            updated_at: parse_ts(11, row.get(11)?)?,
            completed_at: match completed_at {
                Some(s) => Some(parse_ts(12, s)?),
                None => None,
            },
            checksum: row.get(13)?,
            metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        })
    }
}

const TASK_COLUMNS: &str = "id, repository, content, status, priority, tags, estimated_minutes, \
     actual_minutes, parent_task_id, session_id, created_at, updated_at, completed_at, \
     checksum, metadata";

/// Repository-scoped query filter. Every field is optional; unset fields
/// match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub repository: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub tag: Option<String>,
    pub parent_task_id: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<u32>,
}

impl TaskStore {
    // ── Task CRUD ──────────────────────────────────────────────────────

    pub fn create_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks (id, repository, content, status, priority, tags,
                                estimated_minutes, actual_minutes, parent_task_id, session_id,
                                created_at, updated_at, completed_at, checksum, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            task_params(task)?,
        )?;
        Ok(())
    }

    pub fn update_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET repository=?2, content=?3, status=?4, priority=?5, tags=?6,
                    estimated_minutes=?7, actual_minutes=?8, parent_task_id=?9, session_id=?10,
                    created_at=?11, updated_at=?12, completed_at=?13, checksum=?14, metadata=?15
             WHERE id=?1",
            task_params(task)?,
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// Insert-or-replace, used when a sync applies a remote snapshot.
    pub fn upsert_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tasks (id, repository, content, status, priority, tags,
                                estimated_minutes, actual_minutes, parent_task_id, session_id,
                                created_at, updated_at, completed_at, checksum, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            task_params(task)?,
        )?;
        Ok(())
    }

    /// Fetch a live (non-tombstoned) task.
    pub fn get_task(&self, task_id: &str) -> Result<Task> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM tasks WHERE id = ?1 AND deleted = 0",
            TASK_COLUMNS
        ))?;
        stmt.query_row(params![task_id], Task::from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    Error::NotFound(format!("task {}", task_id))
                }
                other => other.into(),
            })
    }

    /// Filtered, repository-scoped listing, newest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {} FROM tasks WHERE deleted = 0", TASK_COLUMNS);
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(repo) = &filter.repository {
            values.push(SqlValue::Text(repo.clone()));
            sql.push_str(&format!(" AND repository = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(SqlValue::Text(status.as_str().into()));
            sql.push_str(&format!(" AND status = ?{}", values.len()));
        }
        if let Some(priority) = filter.priority {
            values.push(SqlValue::Text(priority.as_str().into()));
            sql.push_str(&format!(" AND priority = ?{}", values.len()));
        }
        if let Some(parent) = &filter.parent_task_id {
            values.push(SqlValue::Text(parent.clone()));
            sql.push_str(&format!(" AND parent_task_id = ?{}", values.len()));
        }
        if let Some(session) = &filter.session_id {
            values.push(SqlValue::Text(session.clone()));
            sql.push_str(&format!(" AND session_id = ?{}", values.len()));
        }
        sql.push_str(" ORDER BY updated_at DESC");
        if let Some(limit) = filter.limit {
            values.push(SqlValue::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let tasks: Vec<Task> = stmt
            .query_map(params_from_iter(values), Task::from_row)?
            .filter_map(|r| r.ok())
            .collect();

        // Tag filtering happens after the row scan — tags live in a JSON
        // column and the list sizes here never justify an FTS index.
        let tasks = match &filter.tag {
            Some(tag) => tasks.into_iter().filter(|t| t.tags.contains(tag)).collect(),
            None => tasks,
        };
        Ok(tasks)
    }

    /// Tombstone a task: hidden from queries, preserved until the remote
    /// acknowledges the delete.
    pub fn mark_deleted(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute("UPDATE tasks SET deleted = 1 WHERE id = ?1", params![task_id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }

    /// Hard-delete a row (after remote acknowledgement, or for local-only
    /// deletes while online).
    pub fn remove_task(&self, task_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM task_activity WHERE task_id = ?1", params![task_id])?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        Ok(())
    }

    /// Distinct repositories with live tasks — drives the periodic sync tick.
    pub fn repositories(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT repository FROM tasks WHERE deleted = 0 ORDER BY repository")?;
        let repos = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(repos)
    }

    // ── Activity trail ─────────────────────────────────────────────────

    pub fn add_activity(
        &self,
        task_id: &str,
        kind: &str,
        source: Option<&str>,
        content: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO task_activity (id, task_id, kind, source, content)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![uuid::Uuid::new_v4().to_string(), task_id, kind, source, content],
        )?;
        Ok(())
    }

    pub fn list_activity(&self, task_id: &str, limit: u32) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, content FROM task_activity WHERE task_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![task_id, limit], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(entries)
    }
}

fn task_params(task: &Task) -> Result<[SqlValue; 15]> {
    Ok([
        SqlValue::Text(task.id.clone()),
        SqlValue::Text(task.repository.clone()),
        SqlValue::Text(task.content.clone()),
        SqlValue::Text(task.status.as_str().into()),
        SqlValue::Text(task.priority.as_str().into()),
        SqlValue::Text(serde_json::to_string(&task.tags)?),
        SqlValue::Integer(task.estimated_minutes as i64),
        SqlValue::Integer(task.actual_minutes as i64),
        match &task.parent_task_id {
            Some(p) => SqlValue::Text(p.clone()),
            None => SqlValue::Null,
        },
        match &task.session_id {
            Some(s) => SqlValue::Text(s.clone()),
            None => SqlValue::Null,
        },
        SqlValue::Text(task.created_at.to_rfc3339()),
        SqlValue::Text(task.updated_at.to_rfc3339()),
        match &task.completed_at {
            Some(t) => SqlValue::Text(t.to_rfc3339()),
            None => SqlValue::Null,
        },
        SqlValue::Text(task.checksum.clone()),
        SqlValue::Text(serde_json::to_string(&task.metadata)?),
    ])
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = store();
        let mut task = Task::new("repoA", "Fix auth").unwrap();
        task.add_tag("auth");
        task.metadata.insert("origin".into(), serde_json::json!("cli"));
        store.create_task(&task).unwrap();

        let loaded = store.get_task(&task.id).unwrap();
        assert_eq!(loaded.content, "Fix auth");
        assert_eq!(loaded.tags, vec!["auth".to_string()]);
        assert_eq!(loaded.checksum, task.checksum);
        assert_eq!(loaded.metadata["origin"], serde_json::json!("cli"));
        assert_eq!(loaded.updated_at, task.updated_at);
    }

    #[test]
    fn update_missing_task_is_not_found() {
        let store = store();
        let task = Task::new("repoA", "ghost").unwrap();
        let err = store.update_task(&task).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn filters_scope_by_repository_and_status() {
        let store = store();
        let mut a = Task::new("repoA", "a").unwrap();
        let b = Task::new("repoB", "b").unwrap();
        a.transition(TaskStatus::InProgress).unwrap();
        store.create_task(&a).unwrap();
        store.create_task(&b).unwrap();

        let repo_a = store
            .list_tasks(&TaskFilter { repository: Some("repoA".into()), ..Default::default() })
            .unwrap();
        assert_eq!(repo_a.len(), 1);
        assert_eq!(repo_a[0].id, a.id);

        let in_progress = store
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(in_progress.len(), 1);

        let tagged = store
            .list_tasks(&TaskFilter { tag: Some("none".into()), ..Default::default() })
            .unwrap();
        assert!(tagged.is_empty());
    }

    #[test]
    fn tombstone_hides_but_preserves_row() {
        let store = store();
        let task = Task::new("repoA", "to delete").unwrap();
        store.create_task(&task).unwrap();
        store.mark_deleted(&task.id).unwrap();

        assert_eq!(store.get_task(&task.id).unwrap_err().kind(), "not_found");
        assert!(store.list_tasks(&TaskFilter::default()).unwrap().is_empty());

        // Hard delete removes the row entirely
        store.remove_task(&task.id).unwrap();
        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn activity_trail_is_recorded() {
        let store = store();
        let task = Task::new("repoA", "with history").unwrap();
        store.create_task(&task).unwrap();
        store.add_activity(&task.id, "created", Some("cli"), "created via CLI").unwrap();
        store.add_activity(&task.id, "status", Some("sync"), "pending → in_progress").unwrap();

        let activity = store.list_activity(&task.id, 10).unwrap();
        assert_eq!(activity.len(), 2);
    }
}
