//! Bounded-size chunking of a day's entries for the analysis oracle.
//!
//! Chunk boundaries never split inside a single entry's rendering; an entry
//! whose rendering alone exceeds the limit is kept whole in its own chunk.

use crate::schema::{LogEntry, Role};

pub const DEFAULT_MAX_CHUNK_CHARS: usize = 4000;

/// Render one entry: a header line, one line per message, then a blank line.
pub fn render_entry(entry: &LogEntry) -> String {
    let mut out = format!(
        "[session {}, user {}, {}]\n",
        entry.session_id,
        entry.user_id,
        entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
    );
    for message in &entry.messages {
        match (message.role, message.tool_name.as_deref()) {
            (Role::Tool, Some(name)) => {
                out.push_str(&format!("TOOL({name}): {}\n", message.content));
            }
            (role, _) => {
                out.push_str(&format!("{}: {}\n", role.label(), message.content));
            }
        }
    }
    out.push('\n');
    out
}

/// Accumulate rendered entries into chunks of at most `max_chunk_chars`
/// characters.  The bound is soft: a single oversized entry may exceed it
/// alone, but a buffer that already holds content is flushed before it would
/// overflow.
pub fn chunk_entries(entries: &[LogEntry], max_chunk_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for entry in entries {
        let rendered = render_entry(entry);
        let rendered_chars = rendered.chars().count();
        if !buf.is_empty() && buf_chars + rendered_chars > max_chunk_chars {
            chunks.push(buf.trim_end().to_string());
            buf.clear();
            buf_chars = 0;
        }
        buf.push_str(&rendered);
        buf_chars += rendered_chars;
    }

    if !buf.trim().is_empty() {
        chunks.push(buf.trim_end().to_string());
    }
    chunks
}
