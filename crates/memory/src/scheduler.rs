//! The offline maintenance state machine ("sleep mode").
//!
//! One run walks every unprocessed date sequentially:
//!
//! ```text
//! Discover → per day: Load → Chunk → Analyze → Promote → Digest → Mark
//! ```
//!
//! Dates are processed one at a time so store-write concurrency stays bounded
//! and the dedup snapshot fetched at the start stays valid for the whole run.
//! A date's watermark is advanced only after promotion and digest both
//! succeed; any per-day failure leaves that date unmarked for retry on the
//! next run and the run moves on to the next date.

use std::sync::Arc;
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::analysis::{build_analysis_prompt, parse_sleep_analysis};
use crate::chunk::chunk_entries;
use crate::digest::DigestWriter;
use crate::log_store::{DailyLog, LogStore};
use crate::oracle::TextOracle;
use crate::schema::{MemoryEvent, SleepAnalysis, StoreStats};
use crate::store::{AddOptions, MemoryStore, QueryOptions, StoreMessage};

fn strict_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static regex compiles"))
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceOptions {
    /// Process exactly this date instead of discovering unprocessed ones.
    /// Must match `YYYY-MM-DD`; anything else aborts the whole run.
    pub date: Option<String>,
    /// Report candidate dates and stop: no oracle calls, no store writes,
    /// no watermark changes.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct MaintenanceTuning {
    pub max_chunk_chars: usize,
    pub dedup_context_limit: usize,
    pub fallback_recent_messages: usize,
}

impl Default for MaintenanceTuning {
    fn default() -> Self {
        Self {
            max_chunk_chars: crate::chunk::DEFAULT_MAX_CHUNK_CHARS,
            dedup_context_limit: 200,
            fallback_recent_messages: 20,
        }
    }
}

/// Final summary of one maintenance run.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub candidates: Vec<String>,
    pub processed: Vec<String>,
    pub skipped_empty: Vec<String>,
    /// `(date, error)` for each isolated per-day failure.
    pub failed: Vec<(String, String)>,
    pub additions: usize,
    pub updates: usize,
    pub dry_run: bool,
}

enum DayOutcome {
    Empty,
    Processed { added: usize, updated: usize },
}

pub struct MaintenanceScheduler {
    log_store: LogStore,
    digest: Option<DigestWriter>,
    store: Arc<dyn MemoryStore>,
    oracle: Option<Arc<dyn TextOracle>>,
    tuning: MaintenanceTuning,
}

impl MaintenanceScheduler {
    pub fn new(log_store: LogStore, store: Arc<dyn MemoryStore>) -> Self {
        Self {
            log_store,
            digest: None,
            store,
            oracle: None,
            tuning: MaintenanceTuning::default(),
        }
    }

    /// Enable digest reports under the writer's directory.
    pub fn with_digest(mut self, digest: DigestWriter) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Route analysis through a text-generation oracle.  Without one, the
    /// scheduler falls back to the store's own fact extraction.
    pub fn with_oracle(mut self, oracle: Arc<dyn TextOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_tuning(mut self, tuning: MaintenanceTuning) -> Self {
        self.tuning = tuning;
        self
    }

    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub async fn run(&self, options: &MaintenanceOptions) -> Result<MaintenanceReport> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.run_as_of(options, &today).await
    }

    async fn run_as_of(
        &self,
        options: &MaintenanceOptions,
        today: &str,
    ) -> Result<MaintenanceReport> {
        // Required directories are a run-level failure: abort before any
        // date is touched.
        tokio::fs::create_dir_all(self.log_store.dir())
            .await
            .with_context(|| {
                format!("creating log directory {}", self.log_store.dir().display())
            })?;
        if let Some(digest) = &self.digest {
            tokio::fs::create_dir_all(digest.dir())
                .await
                .with_context(|| format!("creating digest directory {}", digest.dir().display()))?;
        }

        let candidates: Vec<DailyLog> = match &options.date {
            Some(date) => {
                let date = date.trim();
                if !strict_date().is_match(date) {
                    bail!("invalid maintenance date {date:?} (expected YYYY-MM-DD)");
                }
                vec![DailyLog {
                    date: date.to_string(),
                    path: self.log_store.daily_path(date),
                }]
            }
            None => self.log_store.find_unprocessed_as_of(today).await?,
        };

        let mut report = MaintenanceReport {
            candidates: candidates.iter().map(|d| d.date.clone()).collect(),
            dry_run: options.dry_run,
            ..Default::default()
        };

        if options.dry_run {
            info!(
                candidates = report.candidates.len(),
                "dry run, stopping after discovery"
            );
            return Ok(report);
        }

        // The dedup snapshot is fetched once so every day in this run sees a
        // consistent reference list.  Failure here degrades, not aborts.
        let existing: Vec<String> = match self
            .store
            .get_all(&QueryOptions {
                user_id: None,
                limit: Some(self.tuning.dedup_context_limit),
            })
            .await
        {
            Ok(items) => items.into_iter().map(|item| item.memory).collect(),
            Err(err) => {
                warn!(%err, "dedup context fetch failed, continuing without it");
                Vec::new()
            }
        };

        for day in &candidates {
            match self.process_day(day, &existing).await {
                Ok(DayOutcome::Empty) => {
                    info!(date = %day.date, "no entries, day vacuously complete");
                    report.skipped_empty.push(day.date.clone());
                }
                Ok(DayOutcome::Processed { added, updated }) => {
                    info!(date = %day.date, added, updated, "day processed");
                    report.processed.push(day.date.clone());
                    report.additions += added;
                    report.updates += updated;
                }
                Err(err) => {
                    warn!(
                        date = %day.date,
                        error = %format!("{err:#}"),
                        "day failed, left unprocessed for retry"
                    );
                    report.failed.push((day.date.clone(), format!("{err:#}")));
                }
            }
        }

        info!(
            processed = report.processed.len(),
            empty = report.skipped_empty.len(),
            failed = report.failed.len(),
            additions = report.additions,
            updates = report.updates,
            "maintenance run complete"
        );
        Ok(report)
    }

    async fn process_day(&self, day: &DailyLog, existing: &[String]) -> Result<DayOutcome> {
        let entries = self.log_store.read_daily(&day.date).await?;
        if entries.is_empty() {
            // Vacuously complete: no oracle call, no digest.
            self.log_store.mark_processed(&day.date).await?;
            return Ok(DayOutcome::Empty);
        }

        let chunks = chunk_entries(&entries, self.tuning.max_chunk_chars);
        info!(
            date = %day.date,
            entries = entries.len(),
            chunks = chunks.len(),
            "processing day"
        );

        let (analysis, added, updated) = match &self.oracle {
            Some(oracle) => {
                // One combined exchange per day: chunks are rejoined so the
                // oracle sees the whole day at once.
                let combined = chunks.join("\n");
                let dedup = if existing.is_empty() {
                    None
                } else {
                    Some(existing)
                };
                let prompt = build_analysis_prompt(&day.date, &combined, dedup);
                let reply = oracle.complete(&prompt).await?;
                let analysis = parse_sleep_analysis(&reply)?;

                let mut added = 0;
                let mut updated = 0;
                for fact in &analysis.hot_facts {
                    let results = self
                        .store
                        .add(
                            &[StoreMessage::user(fact.clone())],
                            &AddOptions {
                                user_id: None,
                                infer: false,
                            },
                        )
                        .await?;
                    for result in results {
                        match result.event {
                            MemoryEvent::Add => added += 1,
                            MemoryEvent::Update => updated += 1,
                            _ => {}
                        }
                    }
                }
                (analysis, added, updated)
            }
            None => {
                // No oracle configured: hand the tail of the day to the
                // store's own extraction.
                let mut recent: Vec<StoreMessage> = entries
                    .iter()
                    .flat_map(|entry| entry.messages.iter())
                    .map(|m| StoreMessage::new(m.role.as_str(), m.content.clone()))
                    .collect();
                let keep_from = recent
                    .len()
                    .saturating_sub(self.tuning.fallback_recent_messages);
                recent.drain(..keep_from);

                let results = self
                    .store
                    .add(
                        &recent,
                        &AddOptions {
                            user_id: None,
                            infer: true,
                        },
                    )
                    .await?;
                let mut added = 0;
                let mut updated = 0;
                for result in &results {
                    match result.event {
                        MemoryEvent::Add => added += 1,
                        MemoryEvent::Update => updated += 1,
                        _ => {}
                    }
                }
                let analysis = SleepAnalysis {
                    digest: format!(
                        "Store-side extraction over the last {} messages recorded \
                         {added} additions and {updated} updates.",
                        recent.len()
                    ),
                    ..Default::default()
                };
                (analysis, added, updated)
            }
        };

        if let Some(digest) = &self.digest {
            let stats = match self.store.get_all(&QueryOptions::default()).await {
                Ok(items) => Some(StoreStats {
                    hot_memories: items.len(),
                    cold_chunks: chunks.len(),
                }),
                Err(err) => {
                    warn!(date = %day.date, %err, "store stats unavailable, digest written without them");
                    None
                }
            };
            digest.save(&day.date, &analysis, stats.as_ref()).await?;
        }

        // Watermark advance is the last step: a crash anywhere above simply
        // retries the whole date next run.
        self.log_store.mark_processed(&day.date).await?;
        Ok(DayOutcome::Processed { added, updated })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;
    use crate::schema::{AddResult, LogEntry, LogMessage, MemoryItem, Role};

    #[derive(Default)]
    struct MockStore {
        adds: Mutex<Vec<(Vec<StoreMessage>, AddOptions)>>,
        items: Vec<MemoryItem>,
        fail_get_all: bool,
    }

    #[async_trait]
    impl MemoryStore for MockStore {
        async fn add(
            &self,
            messages: &[StoreMessage],
            options: &AddOptions,
        ) -> Result<Vec<AddResult>> {
            self.adds
                .lock()
                .unwrap()
                .push((messages.to_vec(), options.clone()));
            Ok(messages
                .iter()
                .map(|m| AddResult {
                    id: format!("id-{}", m.content.len()),
                    memory: m.content.clone(),
                    event: MemoryEvent::Add,
                })
                .collect())
        }

        async fn search(&self, _query: &str, _options: &QueryOptions) -> Result<Vec<MemoryItem>> {
            Ok(self.items.clone())
        }

        async fn get(&self, _id: &str) -> Result<Option<MemoryItem>> {
            Ok(None)
        }

        async fn get_all(&self, _options: &QueryOptions) -> Result<Vec<MemoryItem>> {
            if self.fail_get_all {
                bail!("store unreachable");
            }
            Ok(self.items.clone())
        }

        async fn delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    struct MockOracle {
        reply: String,
    }

    #[async_trait]
    impl TextOracle for MockOracle {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.reply.clone())
        }
    }

    struct FailingOracle;

    #[async_trait]
    impl TextOracle for FailingOracle {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            bail!("oracle timed out")
        }
    }

    fn temp_dirs() -> (PathBuf, PathBuf) {
        let root = std::env::temp_dir().join(format!("engram-sched-{}", Uuid::new_v4()));
        (root.join("logs"), root.join("digests"))
    }

    fn entry(date: (i32, u32, u32), content: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc
                .with_ymd_and_hms(date.0, date.1, date.2, 10, 0, 0)
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

    const ORACLE_REPLY: &str = r#"{
        "hot_facts": ["user lives in Lisbon", "prod db is postgres 16"],
        "patterns": ["asks for reviews on Fridays"],
        "reflections": [],
        "consolidations": [],
        "digest": "Two durable facts today."
    }"#;

    #[tokio::test]
    async fn invalid_explicit_date_aborts_the_run() {
        let (logs, _) = temp_dirs();
        let store = Arc::new(MockStore::default());
        let scheduler = MaintenanceScheduler::new(LogStore::new(&logs), store.clone());

        let err = scheduler
            .run(&MaintenanceOptions {
                date: Some("02/07/2026".to_string()),
                dry_run: false,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid maintenance date"));
        assert!(store.adds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_run_reports_candidates_without_side_effects() {
        let (logs, _) = temp_dirs();
        let log_store = LogStore::new(&logs);
        log_store.append(&entry((2026, 2, 7), "hello")).await.unwrap();

        let store = Arc::new(MockStore::default());
        let scheduler = MaintenanceScheduler::new(log_store.clone(), store.clone());
        let report = scheduler
            .run_as_of(
                &MaintenanceOptions {
                    date: None,
                    dry_run: true,
                },
                "2026-02-10",
            )
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.candidates, vec!["2026-02-07"]);
        assert!(report.processed.is_empty());
        assert!(store.adds.lock().unwrap().is_empty());
        assert!(log_store.processed_dates().await.is_empty());
    }

    #[tokio::test]
    async fn empty_day_is_vacuously_complete() {
        let (logs, digests) = temp_dirs();
        let log_store = LogStore::new(&logs);
        let store = Arc::new(MockStore::default());
        let scheduler = MaintenanceScheduler::new(log_store.clone(), store.clone())
            .with_digest(DigestWriter::new(&digests))
            .with_oracle(Arc::new(FailingOracle));

        let report = scheduler
            .run(&MaintenanceOptions {
                date: Some("2026-02-07".to_string()),
                dry_run: false,
            })
            .await
            .unwrap();

        assert_eq!(report.skipped_empty, vec!["2026-02-07"]);
        assert!(log_store.processed_dates().await.contains("2026-02-07"));
        // No oracle call happened (FailingOracle would have failed the day)
        // and no digest was written.
        assert!(!digests.join("2026-02-07.md").exists());
        assert!(store.adds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oracle_path_promotes_each_hot_fact() {
        let (logs, digests) = temp_dirs();
        let log_store = LogStore::new(&logs);
        log_store
            .append(&entry((2026, 2, 7), "I moved to Lisbon"))
            .await
            .unwrap();

        let store = Arc::new(MockStore {
            items: vec![MemoryItem {
                id: "m0".to_string(),
                memory: "user prefers rust".to_string(),
                score: None,
                created_at: None,
            }],
            ..Default::default()
        });
        let scheduler = MaintenanceScheduler::new(log_store.clone(), store.clone())
            .with_digest(DigestWriter::new(&digests))
            .with_oracle(Arc::new(MockOracle {
                reply: format!("```json\n{ORACLE_REPLY}\n```"),
            }));

        let report = scheduler
            .run_as_of(&MaintenanceOptions::default(), "2026-02-10")
            .await
            .unwrap();

        assert_eq!(report.processed, vec!["2026-02-07"]);
        assert_eq!(report.additions, 2);
        let adds = store.adds.lock().unwrap();
        assert_eq!(adds.len(), 2);
        assert!(!adds[0].1.infer);
        assert_eq!(adds[0].0[0].content, "user lives in Lisbon");

        let digest = std::fs::read_to_string(digests.join("2026-02-07.md")).unwrap();
        assert!(digest.contains("Two durable facts today."));
        assert!(digest.contains("- hot memories: 1"));
        assert!(log_store.processed_dates().await.contains("2026-02-07"));
    }

    #[tokio::test]
    async fn per_day_failure_is_isolated() {
        let (logs, _) = temp_dirs();
        let log_store = LogStore::new(&logs);
        log_store.append(&entry((2026, 2, 6), "day one")).await.unwrap();
        log_store.append(&entry((2026, 2, 7), "day two")).await.unwrap();

        struct FlakyOracle {
            calls: Mutex<usize>,
        }

        #[async_trait]
        impl TextOracle for FlakyOracle {
            async fn complete(&self, _prompt: &str) -> Result<String> {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    bail!("oracle timed out")
                }
                Ok(ORACLE_REPLY.to_string())
            }
        }

        let store = Arc::new(MockStore::default());
        let scheduler = MaintenanceScheduler::new(log_store.clone(), store.clone())
            .with_oracle(Arc::new(FlakyOracle {
                calls: Mutex::new(0),
            }));

        let report = scheduler
            .run_as_of(&MaintenanceOptions::default(), "2026-02-10")
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "2026-02-06");
        assert!(report.failed[0].1.contains("oracle timed out"));
        assert_eq!(report.processed, vec!["2026-02-07"]);

        let processed = log_store.processed_dates().await;
        assert!(!processed.contains("2026-02-06"));
        assert!(processed.contains("2026-02-07"));

        // The failed date is rediscovered on the next run.
        let pending = log_store.find_unprocessed_as_of("2026-02-10").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].date, "2026-02-06");
    }

    #[tokio::test]
    async fn unparseable_oracle_reply_fails_the_day_only() {
        let (logs, _) = temp_dirs();
        let log_store = LogStore::new(&logs);
        log_store.append(&entry((2026, 2, 7), "hello")).await.unwrap();

        let store = Arc::new(MockStore::default());
        let scheduler = MaintenanceScheduler::new(log_store.clone(), store.clone())
            .with_oracle(Arc::new(MockOracle {
                reply: "Sorry, I can't help with that.".to_string(),
            }));

        let report = scheduler
            .run_as_of(&MaintenanceOptions::default(), "2026-02-10")
            .await
            .unwrap();

        assert_eq!(report.failed.len(), 1);
        assert!(!log_store.processed_dates().await.contains("2026-02-07"));
    }

    #[tokio::test]
    async fn fallback_path_uses_store_extraction_over_recent_tail() {
        let (logs, _) = temp_dirs();
        let log_store = LogStore::new(&logs);
        for i in 0..30 {
            log_store
                .append(&entry((2026, 2, 7), &format!("message {i}")))
                .await
                .unwrap();
        }

        let store = Arc::new(MockStore::default());
        let scheduler = MaintenanceScheduler::new(log_store.clone(), store.clone());
        let report = scheduler
            .run_as_of(&MaintenanceOptions::default(), "2026-02-10")
            .await
            .unwrap();

        assert_eq!(report.processed, vec!["2026-02-07"]);
        let adds = store.adds.lock().unwrap();
        assert_eq!(adds.len(), 1);
        assert!(adds[0].1.infer);
        assert_eq!(adds[0].0.len(), 20);
        assert_eq!(adds[0].0[0].content, "message 10");
        assert_eq!(adds[0].0[19].content, "message 29");
    }

    #[tokio::test]
    async fn dedup_fetch_failure_degrades_without_aborting() {
        let (logs, _) = temp_dirs();
        let log_store = LogStore::new(&logs);
        log_store.append(&entry((2026, 2, 7), "hello")).await.unwrap();

        let store = Arc::new(MockStore {
            fail_get_all: true,
            ..Default::default()
        });
        let scheduler = MaintenanceScheduler::new(log_store.clone(), store.clone())
            .with_oracle(Arc::new(MockOracle {
                reply: ORACLE_REPLY.to_string(),
            }));

        let report = scheduler
            .run_as_of(&MaintenanceOptions::default(), "2026-02-10")
            .await
            .unwrap();
        assert_eq!(report.processed, vec!["2026-02-07"]);
    }

    #[tokio::test]
    async fn end_to_end_watermark_lifecycle() {
        let (logs, _) = temp_dirs();
        let log_store = LogStore::new(&logs);
        log_store.append(&entry((2026, 2, 7), "first")).await.unwrap();
        log_store.append(&entry((2026, 2, 7), "second")).await.unwrap();

        let entries = log_store.read_daily("2026-02-07").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].messages[0].content, "first");
        assert_eq!(entries[1].messages[0].content, "second");

        let pending = log_store.find_unprocessed_as_of("2026-02-10").await.unwrap();
        assert!(pending.iter().any(|d| d.date == "2026-02-07"));

        let store = Arc::new(MockStore::default());
        let scheduler = MaintenanceScheduler::new(log_store.clone(), store);
        let report = scheduler
            .run_as_of(&MaintenanceOptions::default(), "2026-02-10")
            .await
            .unwrap();
        assert_eq!(report.processed, vec!["2026-02-07"]);

        let pending = log_store.find_unprocessed_as_of("2026-02-10").await.unwrap();
        assert!(pending.is_empty());
    }
}
