//! Oracle request construction and reply parsing.
//!
//! [`build_analysis_prompt`] produces the nightly-analysis instruction block;
//! the oracle's reply is expected to be strict JSON, but
//! [`parse_sleep_analysis`] tolerates markdown fences and field-level
//! sloppiness.  Only outright invalid JSON is an error.

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::info;

use crate::schema::{Consolidation, SleepAnalysis};

/// Existing memories beyond this count are not rendered into the dedup
/// reference list.
const DEDUP_RENDER_LIMIT: usize = 50;

/// Build the maintenance analysis prompt for one day's conversation text.
///
/// When `existing_memories` is supplied, at most the first 50 are rendered as
/// a reference list the oracle is told not to re-extract.
pub fn build_analysis_prompt(
    date: &str,
    conversation: &str,
    existing_memories: Option<&[String]>,
) -> String {
    let mut prompt = format!(
        "You are performing nightly memory maintenance over the conversation \
log of {date}. Review the log and extract durable knowledge.\n\n\
Extract, across these categories:\n\
1. new_facts: previously unrecorded facts worth keeping. Cover personal \
identity (names, relationships, locations, preferences), technical and \
infrastructure details (systems, versions, credentials locations, \
configurations), decisions that were made, and behavior rules the assistant \
itself should follow.\n\
2. patterns: recurring behaviors or themes observed across conversations.\n\
3. reflections: what the assistant learned about its own performance today.\n\
4. consolidations: existing facts that duplicate each other and should be \
merged.\n\n\
Classify every extracted fact into a tier: hot (promote to the long-term \
store, retrievable in future conversations), pattern (a recurring theme), or \
digest-only (worth a line in the daily report, not worth storing).\n"
    );

    if let Some(existing) = existing_memories {
        prompt.push_str(
            "\nALREADY RECORDED - these facts exist in the store. Do NOT \
re-extract them or trivial rephrasings of them:\n",
        );
        for memory in existing.iter().take(DEDUP_RENDER_LIMIT) {
            prompt.push_str(&format!("- {memory}\n"));
        }
    }

    prompt.push_str(
        "\nRespond with strict JSON only. No markdown fences, no commentary, \
exactly this shape:\n\
{\"hot_facts\": [\"...\"], \"patterns\": [\"...\"], \"reflections\": \
[\"...\"], \"consolidations\": [{\"merge_ids\": [\"...\"], \"into\": \
\"...\"}], \"digest\": \"one-paragraph summary of the day\"}\n",
    );

    prompt.push_str(&format!("\nCONVERSATION LOG:\n{conversation}"));
    prompt
}

/// Parse the oracle's reply into a [`SleepAnalysis`].
///
/// A leading/trailing markdown code fence (with or without a `json` tag) is
/// stripped first.  Invalid JSON propagates as an error; missing or
/// wrongly-typed fields degrade to empty defaults.
pub fn parse_sleep_analysis(response: &str) -> Result<SleepAnalysis> {
    let body = strip_code_fence(response);
    let value: Value =
        serde_json::from_str(body).context("analysis reply is not valid JSON")?;

    let analysis = SleepAnalysis {
        hot_facts: string_seq(value.get("hot_facts")),
        patterns: string_seq(value.get("patterns")),
        reflections: string_seq(value.get("reflections")),
        consolidations: consolidation_seq(value.get("consolidations")),
        digest: value
            .get("digest")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    };

    info!(
        hot_facts = analysis.hot_facts.len(),
        patterns = analysis.patterns.len(),
        reflections = analysis.reflections.len(),
        consolidations = analysis.consolidations.len(),
        "sleep analysis parsed"
    );
    Ok(analysis)
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

fn string_seq(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn consolidation_seq(value: Option<&Value>) -> Vec<Consolidation> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(|obj| Consolidation {
                    merge_ids: string_seq(obj.get("merge_ids")),
                    into: obj
                        .get("into")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = r#"{
        "hot_facts": ["user lives in Lisbon", "prod db is postgres 16"],
        "patterns": ["asks for code reviews on Fridays"],
        "reflections": ["answered too verbosely"],
        "consolidations": [{"merge_ids": ["m1", "m2"], "into": "merged fact"}],
        "digest": "A quiet day."
    }"#;

    #[test]
    fn parses_plain_json() {
        let analysis = parse_sleep_analysis(REPLY).unwrap();
        assert_eq!(analysis.hot_facts.len(), 2);
        assert_eq!(analysis.patterns.len(), 1);
        assert_eq!(analysis.consolidations[0].merge_ids, vec!["m1", "m2"]);
        assert_eq!(analysis.consolidations[0].into, "merged fact");
        assert_eq!(analysis.digest, "A quiet day.");
    }

    #[test]
    fn strips_fences_with_and_without_language_tag() {
        let fenced = format!("```json\n{REPLY}\n```");
        assert_eq!(
            parse_sleep_analysis(&fenced).unwrap(),
            parse_sleep_analysis(REPLY).unwrap()
        );

        let bare = format!("```\n{REPLY}\n```");
        assert_eq!(
            parse_sleep_analysis(&bare).unwrap(),
            parse_sleep_analysis(REPLY).unwrap()
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_sleep_analysis("I could not comply, sorry.").is_err());
        assert!(parse_sleep_analysis("```json\nnot json\n```").is_err());
    }

    #[test]
    fn missing_and_mistyped_fields_degrade_to_defaults() {
        let analysis = parse_sleep_analysis(r#"{"hot_facts": "oops", "digest": 42}"#).unwrap();
        assert!(analysis.hot_facts.is_empty());
        assert!(analysis.patterns.is_empty());
        assert!(analysis.consolidations.is_empty());
        assert_eq!(analysis.digest, "");

        // Non-string array elements are dropped, not errors.
        let analysis =
            parse_sleep_analysis(r#"{"hot_facts": ["keep", 7, null, "this"]}"#).unwrap();
        assert_eq!(analysis.hot_facts, vec!["keep", "this"]);
    }

    #[test]
    fn consolidation_fields_degrade_individually() {
        let analysis = parse_sleep_analysis(
            r#"{"consolidations": [{"merge_ids": "bad"}, {"into": "kept"}, "junk"]}"#,
        )
        .unwrap();
        assert_eq!(analysis.consolidations.len(), 2);
        assert!(analysis.consolidations[0].merge_ids.is_empty());
        assert_eq!(analysis.consolidations[0].into, "");
        assert_eq!(analysis.consolidations[1].into, "kept");
    }

    #[test]
    fn prompt_renders_dedup_list_capped_at_fifty() {
        let existing: Vec<String> = (0..80).map(|i| format!("fact {i}")).collect();
        let prompt = build_analysis_prompt("2026-02-07", "USER: hi", Some(&existing));
        assert!(prompt.contains("- fact 0\n"));
        assert!(prompt.contains("- fact 49\n"));
        assert!(!prompt.contains("- fact 50\n"));
        assert!(prompt.contains("Do NOT"));
        assert!(prompt.ends_with("CONVERSATION LOG:\nUSER: hi"));
    }

    #[test]
    fn prompt_without_existing_memories_has_no_dedup_section() {
        let prompt = build_analysis_prompt("2026-02-07", "USER: hi", None);
        assert!(!prompt.contains("ALREADY RECORDED"));
        assert!(prompt.contains("2026-02-07"));
        assert!(prompt.contains("hot_facts"));
    }
}
