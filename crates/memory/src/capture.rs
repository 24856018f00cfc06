//! Turn-end capture hook: identity resolution, sanitization, and append.
//!
//! Capture may run concurrently with a maintenance run; that is safe because
//! maintenance never touches the current date's file.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;
use tracing::debug;

use crate::identity::{SessionContext, resolve_canonical, resolve_user_id};
use crate::log_store::LogStore;
use crate::sanitize::build_log_entry;
use crate::schema::LogEntry;

/// Sanitize one raw turn, resolve its user, and append it to today's log.
///
/// Session context is threaded in explicitly per call.  Returns the appended
/// entry, or `None` when nothing survived sanitization.
pub async fn capture_turn(
    log_store: &LogStore,
    ctx: &SessionContext,
    alias_lookup: Option<&HashMap<String, String>>,
    raw_messages: &[Value],
    max_tool_result_chars: usize,
) -> Result<Option<LogEntry>> {
    let raw_id = resolve_user_id(ctx);
    let user_id = resolve_canonical(&raw_id, alias_lookup);
    let channel = ctx.channel.clone().unwrap_or_else(|| "unknown".to_string());
    let session_id = ctx.session_id.clone().unwrap_or_default();

    let Some(entry) = build_log_entry(
        raw_messages,
        &user_id,
        &channel,
        &session_id,
        max_tool_result_chars,
    ) else {
        debug!(%user_id, "nothing survived sanitization, turn not captured");
        return Ok(None);
    };

    log_store.append(&entry).await?;
    Ok(Some(entry))
}
