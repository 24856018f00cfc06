use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker role of one captured message.
///
/// Anything the sanitizer cannot classify collapses to `Assistant`; `system`
/// messages are dropped before this type is ever constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Uppercase label used when rendering entries into analysis chunks.
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
            Self::Tool => "TOOL",
        }
    }

    /// Wire form, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// One captured conversation turn-set.  Immutable once appended to a daily
/// log; only external retention policy ever deletes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub channel: String,
    pub session_id: String,
    pub messages: Vec<LogMessage>,
}

impl LogEntry {
    /// UTC date portion of the timestamp; names the entry's daily log file.
    pub fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}

/// Structured result of one day's oracle analysis.  Transient: only the
/// rendered digest and any promoted facts outlive the maintenance run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SleepAnalysis {
    pub hot_facts: Vec<String>,
    pub patterns: Vec<String>,
    pub reflections: Vec<String>,
    pub consolidations: Vec<Consolidation>,
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Consolidation {
    pub merge_ids: Vec<String>,
    pub into: String,
}

/// Canonical memory-item shape.  Both store backends normalize their
/// responses into this before anything else in the core sees them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// What the store did with one submitted message or fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEvent {
    Add,
    Update,
    Delete,
    Noop,
}

impl MemoryEvent {
    /// Parse a backend event label (case-insensitive).  Unknown labels are
    /// treated as no-ops rather than errors.
    pub fn from_label(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADD" => Self::Add,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Noop,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddResult {
    pub id: String,
    pub memory: String,
    pub event: MemoryEvent,
}

/// Counts rendered into the optional statistics section of a daily digest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hot_memories: usize,
    pub cold_chunks: usize,
}

/// Truncate `s` to at most `max_chars` Unicode scalar values, returning a
/// sub-slice.  Shared by the sanitizer and the search context window.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn entry_date_is_utc_date_portion() {
        let entry = LogEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 2, 7, 23, 59, 58).unwrap(),
            user_id: "telegram:42".to_string(),
            channel: "telegram".to_string(),
            session_id: "s1".to_string(),
            messages: vec![],
        };
        assert_eq!(entry.date(), "2026-02-07");
    }

    #[test]
    fn role_round_trips_through_lowercase_json() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let back: Role = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(back, Role::Tool);
    }

    #[test]
    fn memory_event_labels_parse_case_insensitively() {
        assert_eq!(MemoryEvent::from_label("add"), MemoryEvent::Add);
        assert_eq!(MemoryEvent::from_label("UPDATE"), MemoryEvent::Update);
        assert_eq!(MemoryEvent::from_label("weird"), MemoryEvent::Noop);
    }

    #[test]
    fn truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
