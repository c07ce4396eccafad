// Conflict detection and typed resolution strategies.
//
// A true conflict exists when both sides mutated after the last sync
// (updated_at past the common ancestor time) and the checksums differ. Any
// other divergence still flows through the selected strategy, but only true
// conflicts are announced as `conflict_detected`.

use crate::types::{
    Conflict, ConflictType, Resolution, ResolutionStrategy, Task,
};
use chrono::{DateTime, Utc};

/// Confidence at or above this auto-applies the resolution.
pub const AUTO_APPLY_THRESHOLD: f64 = 0.8;

/// Field-wise comparison of the two snapshots.
pub fn detect_types(local: &Task, remote: &Task) -> Vec<ConflictType> {
    let mut types = Vec::new();
    if local.content != remote.content {
        types.push(ConflictType::Content);
    }
    if local.status != remote.status {
        types.push(ConflictType::Status);
    }
    if local.priority != remote.priority {
        types.push(ConflictType::Priority);
    }
    if local.updated_at != remote.updated_at {
        types.push(ConflictType::Timestamp);
    }
    if local.metadata != remote.metadata {
        types.push(ConflictType::Metadata);
    }
    if local.parent_task_id != remote.parent_task_id
        || local.repository != remote.repository
        || local.session_id != remote.session_id
    {
        types.push(ConflictType::Structural);
    }
    types
}

/// Whether the divergence counts as a conflict: both sides newer than the
/// common ancestor and content-level inequality.
pub fn is_conflict(local: &Task, remote: &Task, ancestor: Option<DateTime<Utc>>) -> bool {
    if local.checksum == remote.checksum {
        return false;
    }
    match ancestor {
        Some(t) => local.updated_at > t && remote.updated_at > t,
        // No recorded ancestor: any two-sided divergence is a conflict
        None => true,
    }
}

/// Confidence base per strategy minus a penalty per additional distinct
/// conflict type. Timestamp divergence is inherent to every conflict and is
/// not penalized, and neither is the first substantive type — a clean
/// two-field last-write-wins resolution stays at the auto-apply bound.
fn confidence(base: f64, detected: &[ConflictType]) -> f64 {
    let substantive = detected
        .iter()
        .filter(|t| **t != ConflictType::Timestamp)
        .count();
    let penalty = 0.05 * substantive.saturating_sub(1) as f64;
    (base - penalty).clamp(0.0, 1.0)
}

/// Build a conflict record with its resolution under `strategy`.
pub fn resolve(local: &Task, remote: &Task, strategy: ResolutionStrategy) -> Conflict {
    let detected = detect_types(local, remote);
    let resolution = match strategy {
        ResolutionStrategy::LastWriteWins => last_write_wins(local, remote, &detected),
        ResolutionStrategy::LocalWins => pick(local.clone(), 0.60, &detected, strategy),
        ResolutionStrategy::RemoteWins => pick(remote.clone(), 0.60, &detected, strategy),
        ResolutionStrategy::Merge => merge(local, remote, &detected),
        ResolutionStrategy::AuthoritativeSource => {
            // The server is the designated source of truth
            pick(remote.clone(), 0.95, &detected, strategy)
        }
        ResolutionStrategy::Manual => Resolution {
            strategy,
            resolved: None,
            confidence: 0.0,
            auto_apply: false,
        },
    };
    Conflict {
        task_id: local.id.clone(),
        local_snapshot: local.clone(),
        remote_snapshot: remote.clone(),
        detected_types: detected,
        resolution: Some(resolution),
    }
}

fn pick(
    snapshot: Task,
    base: f64,
    detected: &[ConflictType],
    strategy: ResolutionStrategy,
) -> Resolution {
    let confidence = confidence(base, detected);
    Resolution {
        strategy,
        resolved: Some(snapshot),
        confidence,
        auto_apply: confidence >= AUTO_APPLY_THRESHOLD,
    }
}

/// Higher `updated_at` wins; checksum-equal snapshots keep the local copy.
fn last_write_wins(local: &Task, remote: &Task, detected: &[ConflictType]) -> Resolution {
    let winner = if local.checksum == remote.checksum {
        local.clone()
    } else if remote.updated_at > local.updated_at {
        remote.clone()
    } else {
        local.clone()
    };
    pick(winner, 0.85, detected, ResolutionStrategy::LastWriteWins)
}

/// Field-level merge: scalars from the newer side, tags united preserving
/// the newer side's display order, metadata united with local precedence,
/// `actual_minutes` as the maximum of both sides.
fn merge(local: &Task, remote: &Task, detected: &[ConflictType]) -> Resolution {
    let (newer, older) = if remote.updated_at > local.updated_at {
        (remote, local)
    } else {
        (local, remote)
    };

    let mut merged = newer.clone();

    // Tags: union, newer side's order first
    for tag in &older.tags {
        if !merged.tags.contains(tag) {
            merged.tags.push(tag.clone());
        }
    }

    // Metadata: union with local precedence on key collision
    let mut metadata = remote.metadata.clone();
    for (key, value) in &local.metadata {
        metadata.insert(key.clone(), value.clone());
    }
    merged.metadata = metadata;

    merged.actual_minutes = local.actual_minutes.max(remote.actual_minutes);
    merged.completed_at = match (local.completed_at, remote.completed_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    // The merge is a fresh mutation: stamp it now and refresh the checksum
    merged.touch();

    pick(merged, 0.70, detected, ResolutionStrategy::Merge)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskPriority, TaskStatus};

    fn pair() -> (Task, Task) {
        let local = Task::new("repoA", "original").unwrap();
        let remote = local.clone();
        (local, remote)
    }

    #[test]
    fn identical_snapshots_are_not_conflicts() {
        let (local, remote) = pair();
        assert!(!is_conflict(&local, &remote, None));
        assert!(detect_types(&local, &remote).is_empty());
    }

    #[test]
    fn detects_fieldwise_divergence() {
        let (mut local, mut remote) = pair();
        local.set_priority(TaskPriority::High);
        remote.set_content("Updated").unwrap();
        let types = detect_types(&local, &remote);
        assert!(types.contains(&ConflictType::Content));
        assert!(types.contains(&ConflictType::Priority));
        assert!(types.contains(&ConflictType::Timestamp));
        assert!(!types.contains(&ConflictType::Status));
    }

    #[test]
    fn ancestor_gate_requires_both_sides_newer() {
        let (mut local, mut remote) = pair();
        let ancestor = Some(Utc::now());
        std::thread::sleep(std::time::Duration::from_millis(5));
        remote.set_content("remote change").unwrap();
        // Local untouched since the ancestor: not a conflict, just a pull
        assert!(!is_conflict(&local, &remote, ancestor));

        local.set_priority(TaskPriority::Low);
        assert!(is_conflict(&local, &remote, ancestor));
    }

    #[test]
    fn last_write_wins_selects_newer_side() {
        let (mut local, mut remote) = pair();
        local.set_priority(TaskPriority::High);
        std::thread::sleep(std::time::Duration::from_millis(5));
        remote.set_content("Updated").unwrap();

        let conflict = resolve(&local, &remote, ResolutionStrategy::LastWriteWins);
        let resolution = conflict.resolution.unwrap();
        let resolved = resolution.resolved.unwrap();
        assert_eq!(resolved.content, "Updated");
        assert!(resolution.confidence >= AUTO_APPLY_THRESHOLD);
        assert!(resolution.auto_apply);
    }

    #[test]
    fn last_write_wins_prefers_local_when_checksums_match() {
        let (mut local, mut remote) = pair();
        // Same logical content, different timestamps
        local.touch();
        remote.updated_at = local.updated_at + chrono::Duration::seconds(10);
        remote.checksum = local.checksum.clone();

        let conflict = resolve(&local, &remote, ResolutionStrategy::LastWriteWins);
        let resolved = conflict.resolution.unwrap().resolved.unwrap();
        assert_eq!(resolved.updated_at, local.updated_at);
    }

    #[test]
    fn local_and_remote_wins_are_unconditional() {
        let (mut local, mut remote) = pair();
        local.set_content("local").unwrap();
        remote.set_content("remote").unwrap();

        let keep_local = resolve(&local, &remote, ResolutionStrategy::LocalWins);
        assert_eq!(keep_local.resolution.unwrap().resolved.unwrap().content, "local");

        let keep_remote = resolve(&local, &remote, ResolutionStrategy::RemoteWins);
        assert_eq!(keep_remote.resolution.unwrap().resolved.unwrap().content, "remote");
    }

    #[test]
    fn merge_unions_tags_and_metadata_with_local_precedence() {
        let (mut local, mut remote) = pair();
        local.add_tag("local-tag");
        local.metadata.insert("shared".into(), serde_json::json!("local"));
        local.metadata.insert("only-local".into(), serde_json::json!(1));
        local.actual_minutes = 30;

        std::thread::sleep(std::time::Duration::from_millis(5));
        remote.add_tag("remote-tag");
        remote.metadata.insert("shared".into(), serde_json::json!("remote"));
        remote.metadata.insert("only-remote".into(), serde_json::json!(2));
        remote.actual_minutes = 45;
        remote.set_content("remote content").unwrap();

        let conflict = resolve(&local, &remote, ResolutionStrategy::Merge);
        let resolved = conflict.resolution.unwrap().resolved.unwrap();

        // Scalars from the newer (remote) side
        assert_eq!(resolved.content, "remote content");
        // Tag union, newer side first
        assert!(resolved.tags.contains(&"remote-tag".to_string()));
        assert!(resolved.tags.contains(&"local-tag".to_string()));
        // Metadata union, local wins collisions
        assert_eq!(resolved.metadata["shared"], serde_json::json!("local"));
        assert_eq!(resolved.metadata["only-local"], serde_json::json!(1));
        assert_eq!(resolved.metadata["only-remote"], serde_json::json!(2));
        // actual_minutes takes the max
        assert_eq!(resolved.actual_minutes, 45);
        // Fresh stamp, consistent checksum
        assert!(resolved.updated_at >= local.updated_at);
        assert!(resolved.updated_at >= remote.updated_at);
    }

    #[test]
    fn authoritative_source_has_high_confidence() {
        let (mut local, mut remote) = pair();
        local.set_content("local").unwrap();
        remote.set_content("remote").unwrap();
        let conflict = resolve(&local, &remote, ResolutionStrategy::AuthoritativeSource);
        let resolution = conflict.resolution.unwrap();
        assert_eq!(resolution.resolved.unwrap().content, "remote");
        assert!(resolution.confidence >= 0.9);
        assert!(resolution.auto_apply);
    }

    #[test]
    fn manual_never_auto_applies() {
        let (mut local, remote) = pair();
        local.set_content("diverged").unwrap();
        let conflict = resolve(&local, &remote, ResolutionStrategy::Manual);
        let resolution = conflict.resolution.unwrap();
        assert!(resolution.resolved.is_none());
        assert_eq!(resolution.confidence, 0.0);
        assert!(!resolution.auto_apply);
    }

    #[test]
    fn confidence_degrades_with_conflict_breadth() {
        let (mut local, mut remote) = pair();
        local.set_priority(TaskPriority::High);
        local.metadata.insert("k".into(), serde_json::json!(1));
        local.parent_task_id = Some("parent".into());
        remote.set_content("changed").unwrap();
        remote.transition(TaskStatus::InProgress).unwrap();

        // content, status, priority, metadata, structural (+ timestamp)
        let wide = resolve(&local, &remote, ResolutionStrategy::LastWriteWins);
        let narrow = {
            let (mut l2, mut r2) = pair();
            l2.set_priority(TaskPriority::High);
            std::thread::sleep(std::time::Duration::from_millis(2));
            r2.set_content("x").unwrap();
            resolve(&l2, &r2, ResolutionStrategy::LastWriteWins)
        };
        assert!(
            wide.resolution.unwrap().confidence < narrow.resolution.unwrap().confidence
        );
    }
}
