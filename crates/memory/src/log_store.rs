//! Append-only daily conversation logs plus the processed-date watermark.
//!
//! Layout under the log directory:
//!
//! ```text
//! <logDir>/<YYYY-MM-DD>.jsonl   one LogEntry JSON object per line
//! <logDir>/.processed           one date string per line, append-only
//! ```
//!
//! This is the cold-storage half of the system: raw logs are searchable only
//! by text scan here; durable facts live in the external store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::schema::LogEntry;

const PROCESSED_FILE: &str = ".processed";

fn daily_file_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4}-\d{2}-\d{2})\.jsonl$").expect("static regex compiles")
    })
}

/// One discovered daily log file.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyLog {
    pub date: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Inclusive lower date bound (`YYYY-MM-DD`).
    pub date_from: Option<String>,
    /// Inclusive upper date bound.
    pub date_to: Option<String>,
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            date_from: None,
            date_to: None,
            limit: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub entry: LogEntry,
    /// Up to 100 characters either side of the first match, `...`-affixed
    /// wherever the window was cut.
    pub context: String,
}

#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn daily_path(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}.jsonl"))
    }

    /// Append one entry to its date's daily file.
    ///
    /// The line and its terminator go out in a single `write_all` against an
    /// O_APPEND handle, so concurrent appenders never interleave partial
    /// lines.  This is the only place the log directory is created
    /// implicitly.
    pub async fn append(&self, entry: &LogEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.daily_path(&entry.date());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read one date's entries in append order.  An absent file yields an
    /// empty sequence; a corrupt line is skipped with a warning rather than
    /// aborting the read.
    pub async fn read_daily(&self, date: &str) -> Result<Vec<LogEntry>> {
        let path = self.daily_path(date);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        for (line_idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(
                        line = line_idx + 1,
                        %err,
                        path = %path.display(),
                        "corrupt JSONL record, skipping line"
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Dates that have completed maintenance.  Absent or unreadable watermark
    /// file yields the empty set.
    pub async fn processed_dates(&self) -> HashSet<String> {
        match tokio::fs::read_to_string(self.dir.join(PROCESSED_FILE)).await {
            Ok(raw) => raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect(),
            Err(_) => HashSet::new(),
        }
    }

    /// Record a date as processed.  Append-only; calling twice for the same
    /// date is harmless since membership is set-based.
    pub async fn mark_processed(&self, date: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(PROCESSED_FILE))
            .await?;
        file.write_all(format!("{date}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Daily logs awaiting maintenance, ascending by date.  The current UTC
    /// date is excluded because its file is still being appended to.
    pub async fn find_unprocessed(&self) -> Result<Vec<DailyLog>> {
        self.find_unprocessed_as_of(&Utc::now().format("%Y-%m-%d").to_string())
            .await
    }

    pub async fn find_unprocessed_as_of(&self, today: &str) -> Result<Vec<DailyLog>> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let processed = self.processed_dates().await;
        let mut found = Vec::new();
        while let Some(dirent) = read_dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(caps) = daily_file_name().captures(name) else {
                continue;
            };
            let date = caps[1].to_string();
            if date == today || processed.contains(&date) {
                continue;
            }
            found.push(DailyLog {
                date,
                path: dirent.path(),
            });
        }

        // Lexicographic order equals chronological order for ISO dates.
        found.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(found)
    }

    /// Case-insensitive substring search across daily logs, newest date
    /// first, stopping once `limit` hits are collected.  At most one hit per
    /// entry (the first matching message).  A missing log directory yields
    /// an empty result.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut dates = Vec::new();
        while let Some(dirent) = read_dir.next_entry().await? {
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(caps) = daily_file_name().captures(name) else {
                continue;
            };
            let date = caps[1].to_string();
            if let Some(from) = &options.date_from {
                if date.as_str() < from.as_str() {
                    continue;
                }
            }
            if let Some(to) = &options.date_to {
                if date.as_str() > to.as_str() {
                    continue;
                }
            }
            dates.push(date);
        }
        dates.sort_by(|a, b| b.cmp(a));

        let query_lower = query.to_lowercase();
        let mut hits = Vec::new();
        'dates: for date in dates {
            for entry in self.read_daily(&date).await? {
                let matched = entry
                    .messages
                    .iter()
                    .find_map(|m| match_context(&m.content, &query_lower));
                if let Some(context) = matched {
                    hits.push(SearchHit { entry, context });
                    if hits.len() >= options.limit {
                        break 'dates;
                    }
                }
            }
        }
        Ok(hits)
    }
}

/// Window of up to 100 characters either side of the first case-insensitive
/// match, with `...` affixed wherever the window was cut short of the full
/// text.  `None` when the text does not match.
fn match_context(text: &str, query_lower: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let pos = lower.find(query_lower)?;

    // Byte offsets come from the lowercased text; clamp onto char boundaries
    // of the original so multi-byte content cannot split a code point.
    let mut start = pos.min(text.len()).saturating_sub(100);
    let mut end = (pos + query_lower.len() + 100).min(text.len());
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }

    let mut context = String::new();
    if start > 0 {
        context.push_str("...");
    }
    context.push_str(&text[start..end]);
    if end < text.len() {
        context.push_str("...");
    }
    Some(context)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LogMessage, Role};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn temp_store() -> (LogStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("engram-logs-{}", Uuid::new_v4()));
        (LogStore::new(&dir), dir)
    }

    fn entry(date: (i32, u32, u32), content: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc
                .with_ymd_and_hms(date.0, date.1, date.2, 12, 0, 0)
                .unwrap(),
            user_id: "telegram:42".to_string(),
            channel: "telegram".to_string(),
            session_id: "s1".to_string(),
            messages: vec![LogMessage {
                role: Role::User,
                content: content.to_string(),
                tool_name: None,
            }],
        }
    }

    #[tokio::test]
    async fn append_and_read_preserve_order() {
        let (store, dir) = temp_store();
        store.append(&entry((2026, 2, 7), "first")).await.unwrap();
        store.append(&entry((2026, 2, 7), "second")).await.unwrap();

        let entries = store.read_daily("2026-02-07").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].messages[0].content, "first");
        assert_eq!(entries[1].messages[0].content, "second");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn read_missing_day_is_empty() {
        let (store, _dir) = temp_store();
        assert!(store.read_daily("2026-01-01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let (store, dir) = temp_store();
        store.append(&entry((2026, 2, 7), "valid")).await.unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(store.daily_path("2026-02-07"))
            .map(|mut f| {
                use std::io::Write;
                writeln!(f, "{{garbage").unwrap();
            })
            .unwrap();
        store.append(&entry((2026, 2, 7), "also valid")).await.unwrap();

        let entries = store.read_daily("2026-02-07").await.unwrap();
        assert_eq!(entries.len(), 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn watermark_round_trip_tolerates_duplicates() {
        let (store, dir) = temp_store();
        store.append(&entry((2026, 2, 7), "x")).await.unwrap();
        assert!(store.processed_dates().await.is_empty());

        store.mark_processed("2026-02-07").await.unwrap();
        store.mark_processed("2026-02-07").await.unwrap();
        let processed = store.processed_dates().await;
        assert_eq!(processed.len(), 1);
        assert!(processed.contains("2026-02-07"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn find_unprocessed_excludes_today_and_processed() {
        let (store, dir) = temp_store();
        store.append(&entry((2026, 2, 6), "a")).await.unwrap();
        store.append(&entry((2026, 2, 7), "b")).await.unwrap();
        store.append(&entry((2026, 2, 8), "c")).await.unwrap();
        store.append(&entry((2026, 2, 10), "today")).await.unwrap();
        store.mark_processed("2026-02-06").await.unwrap();

        let pending = store.find_unprocessed_as_of("2026-02-10").await.unwrap();
        let dates: Vec<&str> = pending.iter().map(|d| d.date.as_str()).collect();
        assert_eq!(dates, vec!["2026-02-07", "2026-02-08"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn find_unprocessed_with_missing_dir_is_empty() {
        let (store, _dir) = temp_store();
        assert!(store.find_unprocessed_as_of("2026-02-10").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_respects_limit_and_scans_newest_first() {
        let (store, dir) = temp_store();
        for day in 1..=10 {
            store
                .append(&entry((2026, 1, day), &format!("rust on day {day}")))
                .await
                .unwrap();
        }

        let hits = store
            .search(
                "RUST",
                &SearchOptions {
                    limit: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].entry.date(), "2026-01-10");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn search_date_bounds_are_inclusive() {
        let (store, dir) = temp_store();
        for day in 5..=9 {
            store
                .append(&entry((2026, 1, day), "needle"))
                .await
                .unwrap();
        }

        let hits = store
            .search(
                "needle",
                &SearchOptions {
                    date_from: Some("2026-01-06".to_string()),
                    date_to: Some("2026-01-08".to_string()),
                    limit: 10,
                },
            )
            .await
            .unwrap();
        let mut dates: Vec<String> = hits.iter().map(|h| h.entry.date()).collect();
        dates.sort();
        assert_eq!(dates, vec!["2026-01-06", "2026-01-07", "2026-01-08"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn search_missing_dir_is_empty() {
        let (store, _dir) = temp_store();
        assert!(store
            .search("anything", &SearchOptions::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn search_context_window_is_ellipsized() {
        let (store, dir) = temp_store();
        let long = format!("{}needle{}", "a".repeat(300), "b".repeat(300));
        store.append(&entry((2026, 2, 7), &long)).await.unwrap();

        let hits = store.search("needle", &SearchOptions::default()).await.unwrap();
        let context = &hits[0].context;
        assert!(context.starts_with("..."));
        assert!(context.ends_with("..."));
        assert!(context.contains("needle"));
        // 100 chars either side, the match itself, and two ellipses.
        assert_eq!(context.chars().count(), 3 + 100 + 6 + 100 + 3);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
