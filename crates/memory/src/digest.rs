//! Human-readable daily maintenance reports.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::schema::{SleepAnalysis, StoreStats};

#[derive(Debug, Clone)]
pub struct DigestWriter {
    dir: PathBuf,
}

impl DigestWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn digest_path(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}.md"))
    }

    /// Render the day's analysis as Markdown and write it to
    /// `<digestDir>/<date>.md`, overwriting any prior digest for that date.
    /// Digest generation is replayable.
    pub async fn save(
        &self,
        date: &str,
        analysis: &SleepAnalysis,
        stats: Option<&StoreStats>,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let doc = render(date, analysis, stats);
        let path = self.digest_path(date);
        tokio::fs::write(&path, doc).await?;
        Ok(path)
    }
}

fn render(date: &str, analysis: &SleepAnalysis, stats: Option<&StoreStats>) -> String {
    let mut doc = format!("# Memory digest for {date}\n\n## Summary\n\n");
    if analysis.digest.is_empty() {
        doc.push_str("(no summary)\n");
    } else {
        doc.push_str(&analysis.digest);
        doc.push('\n');
    }

    doc.push_str("\n## New facts\n\n");
    push_list(&mut doc, &analysis.hot_facts);

    doc.push_str("\n## Patterns\n\n");
    push_list(&mut doc, &analysis.patterns);

    doc.push_str("\n## Self-reflections\n\n");
    push_list(&mut doc, &analysis.reflections);

    doc.push_str("\n## Consolidations\n\n");
    if analysis.consolidations.is_empty() {
        doc.push_str("(none)\n");
    } else {
        for consolidation in &analysis.consolidations {
            doc.push_str(&format!(
                "- merged {} memories into: {}\n",
                consolidation.merge_ids.len(),
                consolidation.into,
            ));
        }
    }

    if let Some(stats) = stats {
        doc.push_str(&format!(
            "\n## Store statistics\n\n- hot memories: {}\n- cold chunks: {}\n",
            stats.hot_memories, stats.cold_chunks,
        ));
    }

    doc
}

fn push_list(doc: &mut String, items: &[String]) {
    if items.is_empty() {
        doc.push_str("(none)\n");
        return;
    }
    for item in items {
        doc.push_str(&format!("- {item}\n"));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
