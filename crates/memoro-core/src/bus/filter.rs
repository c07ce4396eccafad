// Subscriber-side event predicates: by repository, by event type, and by
// payload field match. An unset field matches everything; repository-less
// (global) events pass every repository filter.

use crate::types::{Event, EventType};

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub repository: Option<String>,
    pub event_types: Option<Vec<EventType>>,
    /// Dotted-free single-key payload match: (key, expected value).
    pub payload_match: Option<(String, serde_json::Value)>,
}

impl EventFilter {
    pub fn any() -> Self {
        EventFilter::default()
    }

    pub fn for_repository(repository: impl Into<String>) -> Self {
        EventFilter { repository: Some(repository.into()), ..Default::default() }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let (Some(want), Some(have)) = (&self.repository, &event.repository) {
            if want != have {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some((key, expected)) = &self.payload_match {
            if event.payload.get(key) != Some(expected) {
                return false;
            }
        }
        true
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
