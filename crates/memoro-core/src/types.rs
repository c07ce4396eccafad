// ── Memoro Core: Data Model ────────────────────────────────────────────────
// Canonical types shared by the store, sync engine, event distribution, and
// AI router. Wire-facing structs carry serde attributes; everything else is
// plain data. The status machine lives on `TaskStatus` so every mutation path
// goes through the same transition check.

use crate::checksum;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Task ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(Error::validation(format!("unknown task status '{}'", other))),
        }
    }

    /// The status machine:
    ///   pending ↔ in_progress; pending/in_progress → completed | cancelled;
    ///   completed → pending (reopen); cancelled → pending (reopen).
    /// Everything else is rejected.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, Pending)
                | (Pending, Completed)
                | (InProgress, Completed)
                | (Pending, Cancelled)
                | (InProgress, Cancelled)
                | (Completed, Pending)
                | (Cancelled, Pending)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            other => Err(Error::validation(format!("unknown priority '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub repository: String,
    pub content: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Insertion-ordered for display; duplicates are rejected on add.
    #[serde(default)]
    pub tags: Vec<String>,
    /// 0 = unknown.
    #[serde(default)]
    pub estimated_minutes: u32,
    #[serde(default)]
    pub actual_minutes: u32,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set the first time status becomes completed; never cleared.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Deterministic hash of (content, status, priority, repository, tags).
    pub checksum: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Maximum task content length in characters.
pub const MAX_CONTENT_CHARS: usize = 1000;

impl Task {
    /// Create a pending task, validating the content and repository contracts.
    pub fn new(repository: impl Into<String>, content: impl Into<String>) -> Result<Self> {
        let repository = repository.into();
        let content = content.into();
        validate_repository(&repository)?;
        validate_content(&content)?;
        let now = Utc::now();
        let mut task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            repository,
            content,
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            tags: Vec::new(),
            estimated_minutes: 0,
            actual_minutes: 0,
            parent_task_id: None,
            session_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            checksum: String::new(),
            metadata: HashMap::new(),
        };
        task.recompute_checksum();
        Ok(task)
    }

    /// Recompute the content-derived checksum. Call after any field mutation.
    pub fn recompute_checksum(&mut self) {
        self.checksum = checksum::task_checksum(
            &self.content,
            self.status.as_str(),
            self.priority.as_str(),
            &self.repository,
            &self.tags,
        );
    }

    /// Bump `updated_at` and refresh the checksum. Every mutation path ends
    /// here so the two invariants cannot drift apart.
    pub fn touch(&mut self) {
        let now = Utc::now();
        // updated_at is monotonic per task even under clock skew
        if now > self.updated_at {
            self.updated_at = now;
        } else {
            self.updated_at += chrono::Duration::milliseconds(1);
        }
        self.recompute_checksum();
    }

    /// Apply a status transition through the state machine.
    /// `completed_at` is set on the first completion and never cleared —
    /// reopening preserves both it and `actual_minutes`.
    pub fn transition(&mut self, to: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.as_str().into(),
                to: to.as_str().into(),
            });
        }
        self.status = to;
        if to == TaskStatus::Completed && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
        Ok(())
    }

    /// Replace the content, revalidating the length contract.
    pub fn set_content(&mut self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        validate_content(&content)?;
        self.content = content;
        self.touch();
        Ok(())
    }

    pub fn set_priority(&mut self, priority: TaskPriority) {
        self.priority = priority;
        self.touch();
    }

    /// Append a tag, preserving insertion order. Duplicates are ignored.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
            self.touch();
        }
    }
}

pub fn validate_repository(repository: &str) -> Result<()> {
    if repository.trim().is_empty() {
        return Err(Error::validation("repository must be non-empty"));
    }
    Ok(())
}

pub fn validate_content(content: &str) -> Result<()> {
    let chars = content.chars().count();
    if chars == 0 {
        return Err(Error::validation("content must be non-empty"));
    }
    if chars > MAX_CONTENT_CHARS {
        return Err(Error::validation(format!(
            "content exceeds {} characters ({})",
            MAX_CONTENT_CHARS, chars
        )));
    }
    Ok(())
}

// ── Sync operations (offline queue entries) ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOpKind {
    Create,
    Update,
    Delete,
}

impl SyncOpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOpKind::Create => "create",
            SyncOpKind::Update => "update",
            SyncOpKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(SyncOpKind::Create),
            "update" => Ok(SyncOpKind::Update),
            "delete" => Ok(SyncOpKind::Delete),
            other => Err(Error::validation(format!("unknown sync op kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub operation_id: String,
    pub kind: SyncOpKind,
    pub task_id: String,
    /// Full task snapshot for create/update; absent for delete.
    #[serde(default)]
    pub task_snapshot: Option<Task>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn new(kind: SyncOpKind, task_id: impl Into<String>, snapshot: Option<Task>) -> Self {
        SyncOperation {
            operation_id: uuid::Uuid::new_v4().to_string(),
            kind,
            task_id: task_id.into(),
            task_snapshot: snapshot,
            timestamp: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }
}

// ── Conflicts ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Content,
    Status,
    Priority,
    Timestamp,
    Metadata,
    Structural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    LocalWins,
    RemoteWins,
    Merge,
    AuthoritativeSource,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    /// The snapshot the resolution selects or synthesizes. Absent for manual.
    pub resolved: Option<Task>,
    /// Clamped to [0, 1]; resolutions at or above 0.8 auto-apply.
    pub confidence: f64,
    pub auto_apply: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub task_id: String,
    pub local_snapshot: Task,
    pub remote_snapshot: Task,
    pub detected_types: Vec<ConflictType>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

// ── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    MemoryCreated,
    MemoryUpdated,
    MemoryDeleted,
    System,
    Heartbeat,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "task_created",
            EventType::TaskUpdated => "task_updated",
            EventType::TaskDeleted => "task_deleted",
            EventType::MemoryCreated => "memory_created",
            EventType::MemoryUpdated => "memory_updated",
            EventType::MemoryDeleted => "memory_deleted",
            EventType::System => "system",
            EventType::Heartbeat => "heartbeat",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "task_created" => Ok(EventType::TaskCreated),
            "task_updated" => Ok(EventType::TaskUpdated),
            "task_deleted" => Ok(EventType::TaskDeleted),
            "memory_created" => Ok(EventType::MemoryCreated),
            "memory_updated" => Ok(EventType::MemoryUpdated),
            "memory_deleted" => Ok(EventType::MemoryDeleted),
            "system" => Ok(EventType::System),
            "heartbeat" => Ok(EventType::Heartbeat),
            other => Err(Error::validation(format!("unknown event type '{}'", other))),
        }
    }

    /// Dotted name used on the WebSocket wire (§6 framing).
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventType::TaskCreated => "task.created",
            EventType::TaskUpdated => "task.updated",
            EventType::TaskDeleted => "task.deleted",
            EventType::MemoryCreated => "memory.chunk_created",
            EventType::MemoryUpdated => "memory.chunk_updated",
            EventType::MemoryDeleted => "memory.chunk_deleted",
            EventType::System => "system.message",
            EventType::Heartbeat => "ping",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Topic this event was published on — assigned by the bus.
    #[serde(default)]
    pub topic: String,
    /// Per-topic monotonic counter — assigned by the bus.
    #[serde(default)]
    pub sequence: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    /// Repository scope, used by subscriber filters. `None` = global.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Correlation id for response matching.
    #[serde(default)]
    pub request_id: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, repository: Option<String>, payload: serde_json::Value) -> Self {
        Event {
            topic: String::new(),
            sequence: 0,
            event_type,
            timestamp: Utc::now(),
            repository,
            payload,
            request_id: None,
        }
    }
}

// ── AI requests & responses ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiOperation {
    PrdGenerate,
    TrdGenerate,
    MainTasks,
    SubTasks,
    Analyze,
    Complexity,
    SessionStep,
}

impl AiOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiOperation::PrdGenerate => "prd_generate",
            AiOperation::TrdGenerate => "trd_generate",
            AiOperation::MainTasks => "main_tasks",
            AiOperation::SubTasks => "sub_tasks",
            AiOperation::Analyze => "analyze",
            AiOperation::Complexity => "complexity",
            AiOperation::SessionStep => "session_step",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "prd_generate" => Ok(AiOperation::PrdGenerate),
            "trd_generate" => Ok(AiOperation::TrdGenerate),
            "main_tasks" => Ok(AiOperation::MainTasks),
            "sub_tasks" => Ok(AiOperation::SubTasks),
            "analyze" => Ok(AiOperation::Analyze),
            "complexity" => Ok(AiOperation::Complexity),
            "session_step" => Ok(AiOperation::SessionStep),
            other => Err(Error::validation(format!("unknown AI operation '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub operation: AiOperation,
    pub content: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub preferences: HashMap<String, String>,
    /// Preferred model — routing considers it before provider priority.
    #[serde(default)]
    pub model_hint: Option<String>,
}

impl AiRequest {
    pub fn new(operation: AiOperation, content: impl Into<String>) -> Self {
        AiRequest {
            operation,
            content: content.into(),
            repository: None,
            project_type: None,
            preferences: HashMap::new(),
            model_hint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub id: String,
    pub content: String,
    pub model_used: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Wall-clock latency of the provider call in milliseconds.
    pub latency_ms: u64,
    #[serde(default)]
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    pub overall: ComplexityLevel,
    /// 0–10.
    pub numeric_score: f64,
    #[serde(default)]
    pub factors: Vec<String>,
    pub estimated_hours: f64,
    /// 0–1.
    pub confidence: f64,
}

// ── Providers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Google,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per minute.
    pub rpm: u32,
    /// Extra burst allowance on top of the per-minute window.
    #[serde(default)]
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    /// Name of the environment variable holding the credential — the value
    /// itself is never persisted.
    #[serde(default)]
    pub auth_ref: Option<String>,
    pub supported_operations: Vec<AiOperation>,
    /// Lower = preferred.
    #[serde(default)]
    pub priority: i32,
    pub rate_limit: RateLimitConfig,
    /// Default model used when the request carries no hint.
    pub model: String,
}

// ── AI response cache entries ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub response: AiResponse,
    /// Digest of the normalized request content — lets a sync invalidate
    /// entries derived from a task whose content it just replaced.
    pub content_digest: String,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_pending_with_checksum() {
        let task = Task::new("repoA", "Fix auth").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert_eq!(task.checksum.len(), 64);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn content_contract_enforced() {
        assert!(Task::new("repoA", "").is_err());
        assert!(Task::new("", "x").is_err());
        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(Task::new("repoA", long).is_err());
        let max = "x".repeat(MAX_CONTENT_CHARS);
        assert!(Task::new("repoA", max).is_ok());
    }

    #[test]
    fn status_machine_accepts_legal_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(Completed.can_transition_to(Pending));
        assert!(Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn status_machine_rejects_illegal_transitions() {
        use TaskStatus::*;
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(!Cancelled.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn completed_at_set_once_and_preserved_on_reopen() {
        let mut task = Task::new("repoA", "ship it").unwrap();
        task.actual_minutes = 90;
        task.transition(TaskStatus::Completed).unwrap();
        let completed_at = task.completed_at.unwrap();

        task.transition(TaskStatus::Pending).unwrap();
        assert_eq!(task.completed_at, Some(completed_at));
        assert_eq!(task.actual_minutes, 90);

        // Completing again does not move the original timestamp
        task.transition(TaskStatus::Completed).unwrap();
        assert_eq!(task.completed_at, Some(completed_at));
    }

    #[test]
    fn illegal_transition_leaves_task_unchanged() {
        let mut task = Task::new("repoA", "x").unwrap();
        task.transition(TaskStatus::Completed).unwrap();
        let before = task.clone();
        let err = task.transition(TaskStatus::InProgress).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(task.status, before.status);
        assert_eq!(task.updated_at, before.updated_at);
        assert_eq!(task.checksum, before.checksum);
    }

    #[test]
    fn touch_keeps_updated_at_monotonic() {
        let mut task = Task::new("repoA", "x").unwrap();
        let mut last = task.updated_at;
        for _ in 0..5 {
            task.touch();
            assert!(task.updated_at > last);
            last = task.updated_at;
        }
    }

    #[test]
    fn mutation_invalidates_checksum() {
        let mut task = Task::new("repoA", "original").unwrap();
        let original = task.checksum.clone();
        task.set_content("changed").unwrap();
        assert_ne!(task.checksum, original);
        let changed = task.checksum.clone();
        task.set_priority(TaskPriority::High);
        assert_ne!(task.checksum, changed);
    }

    #[test]
    fn tags_preserve_insertion_order_without_duplicates() {
        let mut task = Task::new("repoA", "x").unwrap();
        task.add_tag("zeta");
        task.add_tag("alpha");
        task.add_tag("zeta");
        assert_eq!(task.tags, vec!["zeta".to_string(), "alpha".to_string()]);
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::TaskCreated.wire_name(), "task.created");
        assert_eq!(EventType::MemoryDeleted.wire_name(), "memory.chunk_deleted");
        assert_eq!(EventType::System.wire_name(), "system.message");
    }

    #[test]
    fn enum_round_trips() {
        for s in ["pending", "in_progress", "completed", "cancelled"] {
            assert_eq!(TaskStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["prd_generate", "complexity", "session_step"] {
            assert_eq!(AiOperation::parse(s).unwrap().as_str(), s);
        }
        assert!(TaskStatus::parse("nope").is_err());
        assert!(EventType::parse("nope").is_err());
    }
}
