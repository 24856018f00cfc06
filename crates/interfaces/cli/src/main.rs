use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use engram_config::{AppConfig, StoreBackend};
use engram_llm::{OllamaClient, OpenRouterClient};
use engram_memory::identity::{IdentityMap, SessionContext, add_alias, build_alias_lookup};
use engram_memory::{
    DigestWriter, LocalStore, LogStore, MaintenanceOptions, MaintenanceScheduler,
    MaintenanceTuning, MemoryStore, PlatformStore, SearchOptions, TextOracle, capture_turn,
};

#[derive(Debug, Parser)]
#[command(
    name = "engram",
    version,
    about = "Long-term memory capture and maintenance for a conversational agent"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "engram.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run offline memory maintenance over unprocessed days.
    Maintain {
        /// Process exactly this date (YYYY-MM-DD) instead of discovering
        /// unprocessed ones.
        #[arg(long)]
        date: Option<String>,
        /// Report candidate dates and stop; no writes of any kind.
        #[arg(long)]
        dry_run: bool,
    },
    /// Full-text search over the raw daily conversation logs.
    Search {
        query: String,
        /// Inclusive lower date bound (YYYY-MM-DD).
        #[arg(long)]
        from: Option<String>,
        /// Inclusive upper date bound (YYYY-MM-DD).
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Capture one conversation turn: raw messages JSON array on stdin.
    Capture {
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        session_key: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Manage the alias table that unifies channel identities.
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },
}

#[derive(Debug, Subcommand)]
enum IdentityCommands {
    /// Attach an alias to a canonical user ID, detaching it from any
    /// previous owner.
    Link {
        canonical: String,
        alias: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Print all known identities.
    List,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Maintain { date, dry_run } => run_maintain(&config, date, dry_run).await,
        Commands::Search {
            query,
            from,
            to,
            limit,
        } => run_search(&config, &query, from, to, limit).await,
        Commands::Capture {
            channel,
            session_key,
            session_id,
        } => run_capture(&config, channel, session_key, session_id).await,
        Commands::Identity { command } => run_identity(&config, command),
    }
}

fn build_store(config: &AppConfig) -> Arc<dyn MemoryStore> {
    match config.store.backend {
        StoreBackend::Local => Arc::new(LocalStore::new(
            config.store.base_url.clone(),
            config.store.api_key.clone(),
        )),
        StoreBackend::Platform => Arc::new(PlatformStore::new(
            config.store.base_url.clone(),
            config.store.api_key.clone(),
        )),
    }
}

fn build_oracle(config: &AppConfig) -> Result<Option<Arc<dyn TextOracle>>> {
    match config.llm.provider.to_ascii_lowercase().as_str() {
        "none" => Ok(None),
        "ollama" => Ok(Some(Arc::new(OllamaClient::new(
            config.llm.ollama_base_url.clone(),
            config.llm.ollama_model.clone(),
        )))),
        "openrouter" => Ok(Some(Arc::new(OpenRouterClient::new(
            config.llm.openrouter_model.clone(),
        )))),
        other => bail!("unknown llm provider {other:?} (expected ollama, openrouter, or none)"),
    }
}

async fn run_maintain(config: &AppConfig, date: Option<String>, dry_run: bool) -> Result<()> {
    let log_store = LogStore::new(&config.memory.log_dir);
    let mut scheduler = MaintenanceScheduler::new(log_store, build_store(config)).with_tuning(
        MaintenanceTuning {
            max_chunk_chars: config.memory.max_chunk_chars,
            dedup_context_limit: config.memory.dedup_context_limit,
            fallback_recent_messages: config.memory.fallback_recent_messages,
        },
    );
    if config.memory.digest_enabled {
        scheduler = scheduler.with_digest(DigestWriter::new(&config.memory.digest_dir));
    }
    if let Some(oracle) = build_oracle(config)? {
        scheduler = scheduler.with_oracle(oracle);
    }

    let report = scheduler.run(&MaintenanceOptions { date, dry_run }).await?;

    if report.dry_run {
        if report.candidates.is_empty() {
            println!("nothing to process");
        } else {
            println!("would process {} day(s):", report.candidates.len());
            for date in &report.candidates {
                println!("  {date}");
            }
        }
        return Ok(());
    }

    println!(
        "maintenance complete: {} processed, {} empty, {} failed ({} additions, {} updates)",
        report.processed.len(),
        report.skipped_empty.len(),
        report.failed.len(),
        report.additions,
        report.updates,
    );
    for (date, err) in &report.failed {
        println!("  {date} failed: {err}");
    }
    Ok(())
}

async fn run_search(
    config: &AppConfig,
    query: &str,
    from: Option<String>,
    to: Option<String>,
    limit: usize,
) -> Result<()> {
    let log_store = LogStore::new(&config.memory.log_dir);
    let hits = log_store
        .search(
            query,
            &SearchOptions {
                date_from: from,
                date_to: to,
                limit,
            },
        )
        .await?;

    if hits.is_empty() {
        println!("no matches");
        return Ok(());
    }
    for hit in hits {
        println!("[{}] {}: {}", hit.entry.date(), hit.entry.user_id, hit.context);
    }
    Ok(())
}

async fn run_capture(
    config: &AppConfig,
    channel: Option<String>,
    session_key: Option<String>,
    session_id: Option<String>,
) -> Result<()> {
    let mut raw = String::new();
    std::io::stdin()
        .read_to_string(&mut raw)
        .context("reading messages from stdin")?;
    let messages: Vec<serde_json::Value> =
        serde_json::from_str(&raw).context("stdin is not a JSON array of messages")?;

    let ctx = SessionContext {
        session_key,
        channel,
        session_id,
    };
    let map = IdentityMap::load(&config.memory.identity_map_path);
    let lookup = build_alias_lookup(map.as_ref());

    let log_store = LogStore::new(&config.memory.log_dir);
    match capture_turn(
        &log_store,
        &ctx,
        lookup.as_ref(),
        &messages,
        config.memory.max_tool_result_chars,
    )
    .await?
    {
        Some(entry) => println!(
            "captured {} message(s) for {} on {}",
            entry.messages.len(),
            entry.user_id,
            entry.date(),
        ),
        None => println!("nothing captured (all messages filtered)"),
    }
    Ok(())
}

fn run_identity(config: &AppConfig, command: IdentityCommands) -> Result<()> {
    let path = PathBuf::from(&config.memory.identity_map_path);
    match command {
        IdentityCommands::Link {
            canonical,
            alias,
            label,
        } => {
            let mut map = IdentityMap::load(&path).unwrap_or_default();
            let (added, entry) = add_alias(&mut map, &canonical, &alias, label.as_deref());
            let alias_count = entry.aliases.len();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            map.save(&path)?;
            if added {
                println!("linked {alias} -> {canonical} ({alias_count} alias(es))");
            } else {
                println!("{alias} already linked to {canonical}");
            }
        }
        IdentityCommands::List => {
            let Some(map) = IdentityMap::load(&path) else {
                println!("no identities recorded");
                return Ok(());
            };
            for entry in &map.identities {
                let label = entry.label.as_deref().unwrap_or("-");
                println!("{} [{}]: {}", entry.canonical, label, entry.aliases.join(", "));
            }
        }
    }
    Ok(())
}
