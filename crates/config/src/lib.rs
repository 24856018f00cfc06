use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Agent ID used as the first segment of host session keys
    /// (`agent:<id>:<provider>:<peer>`).
    pub agent_id: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Engram".to_string(),
            agent_id: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding the daily `<YYYY-MM-DD>.jsonl` conversation logs and
    /// the `.processed` watermark file.
    pub log_dir: String,
    /// Directory where daily digest reports are written.
    pub digest_dir: String,
    /// Identity map file (`{"identities": [...]}`).
    pub identity_map_path: String,
    /// Soft upper bound on the size of one analysis chunk, in characters.
    /// A single oversized entry may still exceed this on its own.
    pub max_chunk_chars: usize,
    /// Tool-result text longer than this is truncated at capture time.
    pub max_tool_result_chars: usize,
    /// Write a markdown digest for each processed day.
    pub digest_enabled: bool,
    /// Maximum number of existing memories fetched as dedup context before a
    /// maintenance run.  The prompt builder renders at most 50 of them.
    pub dedup_context_limit: usize,
    /// Number of trailing messages fed to the store's own extraction when no
    /// oracle is configured.
    pub fallback_recent_messages: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            log_dir: ".engram/logs".to_string(),
            digest_dir: ".engram/digests".to_string(),
            identity_map_path: ".engram/identities.json".to_string(),
            max_chunk_chars: 4000,
            max_tool_result_chars: 500,
            digest_enabled: true,
            dedup_context_limit: 200,
            fallback_recent_messages: 20,
        }
    }
}

/// Which long-term store implementation to talk to.
///
/// | Backend    | Conventions                                          |
/// |------------|------------------------------------------------------|
/// | `local`    | self-hosted server, snake_case fields, flat arrays   |
/// | `platform` | hosted API, camelCase fields, `{results: [...]}`     |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Local,
    Platform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub base_url: String,
    /// API key sent as a bearer token.  Overridden at runtime by the
    /// `ENGRAM_STORE_API_KEY` environment variable when set.
    pub api_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Local,
            base_url: "http://localhost:8765".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `ollama`, `openrouter`, or `none` to disable the oracle and fall back
    /// to store-side extraction during maintenance.
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub memory: MemoryConfig,
    pub store: StoreConfig,
    pub llm: LlmConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(url) = env::var("OLLAMA_BASE_URL") {
            if !url.is_empty() {
                config.llm.ollama_base_url = url;
            }
        }

        // Store API key env override (takes precedence over config file).
        if let Ok(key) = env::var("ENGRAM_STORE_API_KEY") {
            if !key.is_empty() {
                config.store.api_key = key;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn oracle_enabled(&self) -> bool {
        !self.llm.provider.eq_ignore_ascii_case("none")
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.memory.max_chunk_chars, 4000);
        assert_eq!(cfg.memory.max_tool_result_chars, 500);
        assert_eq!(cfg.store.backend, StoreBackend::Local);
        assert!(!cfg.oracle_enabled());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engram.toml");

        let mut cfg = AppConfig::default();
        cfg.memory.log_dir = "/var/lib/engram/logs".to_string();
        cfg.store.backend = StoreBackend::Platform;
        cfg.llm.provider = "ollama".to_string();
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.memory.log_dir, "/var/lib/engram/logs");
        assert_eq!(loaded.store.backend, StoreBackend::Platform);
        assert!(loaded.oracle_enabled());
    }

    #[test]
    fn partial_file_fills_remaining_sections_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engram.toml");
        fs::write(&path, "[memory]\nmax_chunk_chars = 1234\n").unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.memory.max_chunk_chars, 1234);
        assert_eq!(cfg.memory.digest_dir, ".engram/digests");
        assert_eq!(cfg.llm.ollama_model, "llama3.1:8b");
    }

    #[test]
    fn unknown_backend_string_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engram.toml");
        fs::write(&path, "[store]\nbackend = \"qdrant\"\n").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }
}
