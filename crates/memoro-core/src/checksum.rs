// ── Memoro Core: Checksums & Fingerprints ──────────────────────────────────
// Content-derived hashes used for equality detection during sync and for AI
// response cache keys. Both sides of a sync must produce identical digests
// for identical logical content, so the input is canonicalized first.

use sha2::{Digest, Sha256};

/// SHA-256 over the canonicalized tuple
/// `content|status|priority|repository|sorted_tags`, hex-encoded.
/// Tags are sorted so display order never affects the digest.
pub fn task_checksum(
    content: &str,
    status: &str,
    priority: &str,
    repository: &str,
    tags: &[String],
) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
    sorted.sort_unstable();
    let canonical = format!(
        "{}|{}|{}|{}|{}",
        content,
        status,
        priority,
        repository,
        sorted.join(",")
    );
    hex_digest(canonical.as_bytes())
}

/// Normalize free-form content for cache fingerprinting: lowercase and
/// collapse all whitespace runs to single spaces. Two requests that differ
/// only in formatting share a fingerprint.
pub fn normalize_content(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache fingerprint for an AI request:
/// `hash(operation, normalized_content, model_used_or_any)`.
pub fn request_fingerprint(operation: &str, content: &str, model: Option<&str>) -> String {
    let canonical = format!(
        "{}\u{1f}{}\u{1f}{}",
        operation,
        normalize_content(content),
        model.unwrap_or("any")
    );
    hex_digest(canonical.as_bytes())
}

/// Digest of normalized content alone — stored beside cache entries so a sync
/// that replaces a task's content can invalidate the entries derived from it.
pub fn content_digest(content: &str) -> String {
    hex_digest(normalize_content(content).as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// ── Tests ──────────────────────────────────────────────────────────────────
