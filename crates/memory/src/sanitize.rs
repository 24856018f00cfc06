//! Turn-end message cleaning.
//!
//! Raw host payloads are loosely-typed JSON; this module strips the noise
//! (binary payloads, injected memory context, oversized tool output) and
//! produces the normalized [`LogMessage`] records the log store persists.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::Value;

use crate::schema::{LogEntry, LogMessage, Role, truncate_chars};

/// Marker injected into prompts when stored memories are surfaced to the
/// model.  Messages containing it are never re-ingested, which would
/// otherwise feed extracted facts back into extraction.
pub const MEMORY_CONTEXT_MARKER: &str = "<relevant-memories>";

pub const DEFAULT_MAX_TOOL_RESULT_CHARS: usize = 500;

fn base64_data_uri() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"data:[^;,\s]+;base64,[A-Za-z0-9+/=]{100,}").expect("static regex compiles")
    })
}

/// Extract plain text from a message body: either a bare string, or an array
/// of content blocks where `text` blocks contribute their text and image
/// blocks contribute an `[image]` placeholder.
fn extract_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                let Some(kind) = block.get("type").and_then(Value::as_str) else {
                    continue;
                };
                match kind {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            parts.push(text.to_string());
                        }
                    }
                    "image" | "image_url" => parts.push("[image]".to_string()),
                    _ => {}
                }
            }
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Clean a raw message sequence into normalized records.
///
/// Dropped entirely: non-objects, messages without a string role, `system`
/// messages, messages with no extractable text, and messages carrying the
/// re-injection marker.  Base64 data-URI payloads of 100+ encoded characters
/// are replaced with `[base64-data]`; tool output longer than
/// `max_tool_result_chars` is truncated.
pub fn clean_messages(raw: &[Value], max_tool_result_chars: usize) -> Vec<LogMessage> {
    let mut cleaned = Vec::new();

    for message in raw {
        let Some(obj) = message.as_object() else {
            continue;
        };
        let Some(role) = obj.get("role").and_then(Value::as_str) else {
            continue;
        };
        if role == "system" {
            continue;
        }

        let Some(text) = extract_text(obj.get("content")) else {
            continue;
        };
        if text.is_empty() || text.contains(MEMORY_CONTEXT_MARKER) {
            continue;
        }

        let text = base64_data_uri().replace_all(&text, "[base64-data]").into_owned();

        let role = match role {
            "user" => Role::User,
            "tool" => Role::Tool,
            _ => Role::Assistant,
        };

        let content = if role == Role::Tool && text.chars().count() > max_tool_result_chars {
            format!("{} [truncated]", truncate_chars(&text, max_tool_result_chars))
        } else {
            text
        };

        let tool_name = if role == Role::Tool {
            obj.get("name").and_then(Value::as_str).map(String::from)
        } else {
            None
        };

        cleaned.push(LogMessage {
            role,
            content,
            tool_name,
        });
    }

    cleaned
}

/// Clean a raw turn and wrap the survivors into a timestamped [`LogEntry`].
/// Returns `None` when nothing survives cleaning.
pub fn build_log_entry(
    raw: &[Value],
    user_id: &str,
    channel: &str,
    session_id: &str,
    max_tool_result_chars: usize,
) -> Option<LogEntry> {
    let messages = clean_messages(raw, max_tool_result_chars);
    if messages.is_empty() {
        return None;
    }
    Some(LogEntry {
        timestamp: Utc::now(),
        user_id: user_id.to_string(),
        channel: channel.to_string(),
        session_id: session_id.to_string(),
        messages,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
