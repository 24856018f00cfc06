//! Stable per-user identity across heterogeneous chat channels.
//!
//! Two layers:
//!
//! 1. **Session-key resolution**: [`resolve_user_id`] derives a raw,
//!    deterministic identifier from whatever the chat host hands us.
//! 2. **Alias table**: [`IdentityMap`] maps raw per-channel identifiers onto
//!    one canonical user ID, so the same person on Telegram and Discord is
//!    unified in the long-term store.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Per-turn context handed in by the chat host.  Threaded explicitly into
/// every call that needs it; there is no ambient session state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    /// Host session key, usually `agent:<agentId>:<provider>:<peerId...>`.
    pub session_key: Option<String>,
    /// Channel provider name (`telegram`, `discord`, ...).
    pub channel: Option<String>,
    pub session_id: Option<String>,
}

/// Deterministic 8-hex-char digest of an arbitrary string.  Stable across
/// runs and platforms; collisions are acceptable for fallback IDs.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Derive a stable raw user ID from the session context.
///
/// Resolution order:
/// 1. `agent:<id>:<provider>:<peer...>` session key → `"<provider>:<peer>"`
///    (the peer may itself contain colons);
/// 2. channel + session key → `"<channel>:<short_hash(key)>"`;
/// 3. session key alone → `"session:<short_hash(key)>"`;
/// 4. nothing → `"default"`.
pub fn resolve_user_id(ctx: &SessionContext) -> String {
    if let Some(key) = ctx.session_key.as_deref() {
        if let Some(rest) = key.strip_prefix("agent:") {
            let mut parts = rest.splitn(3, ':');
            let _agent_id = parts.next();
            if let (Some(provider), Some(peer)) = (parts.next(), parts.next()) {
                if !provider.is_empty() && !peer.is_empty() {
                    return format!("{provider}:{peer}");
                }
            }
        }
        if let Some(channel) = ctx.channel.as_deref() {
            if !channel.is_empty() {
                return format!("{channel}:{}", short_hash(key));
            }
        }
        return format!("session:{}", short_hash(key));
    }
    "default".to_string()
}

/// Heuristic group-chat detection from the session key.
///
/// True for Telegram group IDs (negative last path segment alongside a
/// `telegram:` segment) and for keys containing `:group:` or `:channel:`.
pub fn is_group_chat(ctx: &SessionContext) -> bool {
    let Some(key) = ctx.session_key.as_deref() else {
        return false;
    };
    if key.contains(":group:") || key.contains(":channel:") {
        return true;
    }
    if key.contains("telegram:") {
        if let Some(last) = key.rsplit(':').next() {
            return last.starts_with('-');
        }
    }
    false
}

// ── Alias table ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub canonical: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// On-disk shape: `{"identities": [{canonical, aliases, label?}, ...]}`.
///
/// Invariant: any alias string belongs to at most one entry at a time.
/// [`add_alias`] enforces this by detaching an alias from its previous owner
/// before attaching it elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityMap {
    pub identities: Vec<IdentityEntry>,
}

impl IdentityMap {
    /// Load the map, failing soft: a missing file, unreadable file, malformed
    /// JSON, or a non-sequence `identities` field all yield `None`.
    pub fn load(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Self>(&raw) {
            Ok(map) => Some(map),
            Err(err) => {
                warn!(path = %path.display(), %err, "identity map unreadable; ignoring");
                None
            }
        }
    }

    /// Write pretty-printed JSON with a trailing newline, overwriting.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut rendered = serde_json::to_string_pretty(self)?;
        rendered.push('\n');
        fs::write(path, rendered)?;
        Ok(())
    }
}

/// Flatten a map into `alias → canonical` form.  Every canonical ID also maps
/// to itself so canonical IDs are valid lookup keys.
pub fn build_alias_lookup(map: Option<&IdentityMap>) -> Option<HashMap<String, String>> {
    let map = map?;
    let mut lookup = HashMap::new();
    for entry in &map.identities {
        for alias in &entry.aliases {
            lookup.insert(alias.clone(), entry.canonical.clone());
        }
        lookup.insert(entry.canonical.clone(), entry.canonical.clone());
    }
    Some(lookup)
}

/// Map a raw ID to its canonical ID; unknown IDs (or no lookup at all) pass
/// through unchanged.
pub fn resolve_canonical(raw_id: &str, lookup: Option<&HashMap<String, String>>) -> String {
    lookup
        .and_then(|l| l.get(raw_id))
        .cloned()
        .unwrap_or_else(|| raw_id.to_string())
}

/// Attach `alias` to the entry for `canonical`, creating the entry if needed
/// and detaching the alias from any other entry first.  Mutates in place.
///
/// Returns `(added, entry)` where `added` is false when the association
/// already existed.
pub fn add_alias<'a>(
    map: &'a mut IdentityMap,
    canonical: &str,
    alias: &str,
    label: Option<&str>,
) -> (bool, &'a IdentityEntry) {
    // Detach from any previous owner so the alias-uniqueness invariant holds.
    for entry in &mut map.identities {
        if entry.canonical != canonical {
            entry.aliases.retain(|a| a != alias);
        }
    }

    let idx = match map.identities.iter().position(|e| e.canonical == canonical) {
        Some(idx) => idx,
        None => {
            map.identities.push(IdentityEntry {
                canonical: canonical.to_string(),
                aliases: Vec::new(),
                label: None,
            });
            map.identities.len() - 1
        }
    };

    let entry = &mut map.identities[idx];
    if let Some(label) = label {
        entry.label = Some(label.to_string());
    }

    let added = if entry.aliases.iter().any(|a| a == alias) {
        false
    } else {
        entry.aliases.push(alias.to_string());
        true
    };

    (added, &map.identities[idx])
}

// ── Tests ─────────────────────────────────────────────────────────────────────
