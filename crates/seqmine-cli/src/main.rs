use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use seqmine_core::{normalize_id, raw, KeywordRules};
use seqmine_fetch::{CacheStore, Fetcher, OeisClient};
use seqmine_guess::{DispatchConfig, Dispatcher, SandboxedEngine, XrefMatcher};
use seqmine_storage::{Blacklist, MinerStore, RecordFilter};

mod config;
mod pipeline;

use config::RuntimeConfig;

#[derive(Parser)]
#[command(name = "seqmine")]
#[command(about = "Mines closed-form formulas from a public integer-sequence database", long_about = None)]
struct Cli {
    /// Sqlite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Directory holding the compressed raw-payload cache
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Base URL of the remote sequence repository
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Shell command line for the symbolic engine subprocess
    #[arg(long, global = true)]
    engine_cmd: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed the record table with unvisited ids A000001..=A<count>
    Init {
        #[arg(long, default_value_t = 368_000)]
        count: u32,
    },
    /// Run the mining pipeline until no unvisited records remain
    Mine {
        /// Records selected per batch
        #[arg(long, default_value_t = 100)]
        limit: u32,
        /// Terms handed to the first-phase guess
        #[arg(long, default_value_t = 10)]
        prefix_len: usize,
        /// Skip guessing below this many published terms
        #[arg(long, default_value_t = 8)]
        min_terms: usize,
        /// Wall-clock budget per engine invocation, in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Do not retry the full term list when the prefix phase misses
        #[arg(long)]
        no_full_fallback: bool,
        /// Abort the run after this many consecutive fetch failures
        #[arg(long, default_value_t = 10)]
        max_consecutive_failures: u32,
        /// Log progress counters every N processed records
        #[arg(long, default_value_t = 10)]
        report_every: u64,
        /// Source keyword that marks a record hard (repeatable)
        #[arg(long = "hard-marker", value_name = "KEYWORD", default_values_t = ["hard".to_string()])]
        hard_markers: Vec<String>,
        /// Source keyword whose absence marks a record not-easy (repeatable)
        #[arg(long = "easy-marker", value_name = "KEYWORD", default_values_t = ["easy".to_string()])]
        easy_markers: Vec<String>,
    },
    /// Populate the cache for an inclusive id range without analysis
    Download {
        #[arg(long)]
        start: u32,
        #[arg(long)]
        end: u32,
        #[arg(long, default_value_t = 10)]
        max_consecutive_failures: u32,
    },
    /// Cross-reference pass over all discovered closed forms
    Xref {
        /// Wall-clock budget per equivalence check, in seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Manage the engine blacklist
    Blacklist {
        #[command(subcommand)]
        action: BlacklistCommands,
    },
    /// Recompute run statistics from the record store
    Stats,
    /// List visited records matching predicate filters
    Query {
        /// Only records tagged hard by the source
        #[arg(long)]
        hard: bool,
        /// Only records not tagged easy by the source
        #[arg(long)]
        not_easy: bool,
        /// Only first-time discoveries
        #[arg(long)]
        new: bool,
        /// Only formulas verified against the full term list
        #[arg(long)]
        checked: bool,
        /// Only records with a discovered closed form
        #[arg(long)]
        found: bool,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Fetch one record (cache first) and print it
    Show { id: String },
}

#[derive(Subcommand)]
enum BlacklistCommands {
    /// Add an id so the engine is never invoked for it again
    Add {
        id: String,
        #[arg(long, default_value = "manual")]
        reason: String,
    },
    /// Remove an id; the only way an entry ever leaves the blacklist
    Remove { id: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let Cli {
        db,
        cache_dir,
        base_url,
        engine_cmd,
        command,
    } = Cli::parse();
    let config = RuntimeConfig::resolve(db, cache_dir, base_url, engine_cmd);

    match command {
        Commands::Init { count } => cmd_init(&config, count),
        Commands::Mine {
            limit,
            prefix_len,
            min_terms,
            timeout_secs,
            no_full_fallback,
            max_consecutive_failures,
            report_every,
            hard_markers,
            easy_markers,
        } => {
            let dispatch = DispatchConfig {
                prefix_len,
                min_terms,
                timeout: Duration::from_secs(timeout_secs),
                full_fallback: !no_full_fallback,
            };
            let mine = pipeline::MineConfig {
                batch_limit: limit,
                max_consecutive_failures,
                report_every,
            };
            let rules = KeywordRules {
                hard_markers,
                easy_markers,
            };
            cmd_mine(config, dispatch, mine, rules).await
        }
        Commands::Download {
            start,
            end,
            max_consecutive_failures,
        } => cmd_download(config, start, end, max_consecutive_failures).await,
        Commands::Xref { timeout_secs } => {
            cmd_xref(config, Duration::from_secs(timeout_secs)).await
        }
        Commands::Blacklist { action } => cmd_blacklist(&config, action),
        Commands::Stats => cmd_stats(&config),
        Commands::Query {
            hard,
            not_easy,
            new,
            checked,
            found,
            limit,
        } => cmd_query(
            &config,
            RecordFilter {
                hard: hard.then_some(true),
                not_easy: not_easy.then_some(true),
                is_new: new.then_some(true),
                check_cf: checked.then_some(true),
                found: found.then_some(true),
                limit: Some(limit),
            },
        ),
        // The blocking HTTP client must stay off the async worker threads.
        Commands::Show { id } => {
            tokio::task::spawn_blocking(move || cmd_show(&config, &id)).await?
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_store(config: &RuntimeConfig) -> Result<MinerStore> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    MinerStore::open(&config.db_path)
        .with_context(|| format!("opening record store {}", config.db_path.display()))
}

fn build_fetcher(config: &RuntimeConfig) -> Result<Fetcher<OeisClient>> {
    let cache = CacheStore::open(&config.cache_dir)
        .with_context(|| format!("opening cache {}", config.cache_dir.display()))?;
    let client = OeisClient::new(config.base_url.clone(), config.request_timeout)?;
    Ok(Fetcher::new(client, cache, config.fetch_policy))
}

fn require_engine(config: &RuntimeConfig) -> Result<SandboxedEngine> {
    let cmdline = config
        .engine_cmd
        .clone()
        .context("no engine configured; pass --engine-cmd or set SEQMINE_ENGINE_CMD")?;
    Ok(SandboxedEngine::new(cmdline))
}

/// Run a blocking pipeline task while a ctrl-c watcher flips the shared stop
/// flag; the task only observes the flag between records, so an interrupt
/// never leaves a half-recorded guess behind.
async fn run_with_stop<T, F>(task: F) -> Result<T>
where
    F: FnOnce(Arc<AtomicBool>) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let watcher = tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("stop requested, finishing the current record");
                stop.store(true, Ordering::Relaxed);
            }
        }
    });
    let result = tokio::task::spawn_blocking(move || task(stop)).await?;
    watcher.abort();
    result
}

fn cmd_init(config: &RuntimeConfig, count: u32) -> Result<()> {
    let store = open_store(config)?;
    let inserted = store.seed_ids(count)?;
    println!("seeded {inserted} new ids (table now covers 1..={count})");
    Ok(())
}

async fn cmd_mine(
    config: RuntimeConfig,
    dispatch: DispatchConfig,
    mine: pipeline::MineConfig,
    rules: KeywordRules,
) -> Result<()> {
    let engine = require_engine(&config)?;
    let summary = run_with_stop(move |stop| {
        let store = open_store(&config)?;
        let mut blacklist = Blacklist::load(&store)?;
        let fetcher = build_fetcher(&config)?;
        let dispatcher = Dispatcher::new(engine, dispatch);
        pipeline::run_mine(
            &store,
            &fetcher,
            &dispatcher,
            &mut blacklist,
            &rules,
            &mine,
            &stop,
        )
    })
    .await?;

    let stats = summary.stats;
    info!(
        processed = stats.processed,
        found = stats.found,
        new_found = stats.new_found,
        found_ratio = stats.found_ratio(),
        new_ratio = stats.new_ratio(),
        stopped = summary.stopped,
        "mining run complete"
    );
    Ok(())
}

async fn cmd_download(
    config: RuntimeConfig,
    start: u32,
    end: u32,
    max_consecutive_failures: u32,
) -> Result<()> {
    let summary = run_with_stop(move |stop| {
        let fetcher = build_fetcher(&config)?;
        pipeline::run_download(&fetcher, start, end, max_consecutive_failures, &stop)
    })
    .await?;

    info!(
        fetched = summary.fetched,
        already_cached = summary.already_cached,
        failed = summary.failed,
        stopped = summary.stopped,
        "download complete"
    );
    Ok(())
}

async fn cmd_xref(config: RuntimeConfig, timeout: Duration) -> Result<()> {
    let engine = require_engine(&config)?;
    let report = run_with_stop(move |stop| {
        let store = open_store(&config)?;
        let mut blacklist = Blacklist::load(&store)?;
        let matcher = XrefMatcher::new(engine, timeout);
        Ok(matcher.run(&store, &mut blacklist, &stop)?)
    })
    .await?;

    info!(
        pairs = report.pairs,
        compared = report.compared,
        matched = report.matched,
        skipped = report.skipped,
        "cross-reference pass complete"
    );
    Ok(())
}

fn cmd_blacklist(config: &RuntimeConfig, action: BlacklistCommands) -> Result<()> {
    let store = open_store(config)?;
    match action {
        BlacklistCommands::Add { id, reason } => {
            let key = canonical_key(&id);
            if store.blacklist_add(&key, &reason)? {
                println!("blacklisted {key}");
            } else {
                println!("{key} was already blacklisted");
            }
        }
        BlacklistCommands::Remove { id } => {
            let key = canonical_key(&id);
            if store.blacklist_remove(&key)? {
                println!("removed {key}");
            } else {
                println!("{key} is not blacklisted");
            }
        }
        BlacklistCommands::List => {
            let entries = store.blacklist_entries()?;
            for entry in &entries {
                println!(
                    "{}  {}  {}",
                    entry.id,
                    entry.added_at.to_rfc3339(),
                    entry.reason
                );
            }
            println!("{} blacklisted", entries.len());
        }
    }
    Ok(())
}

/// Sequence ids get their canonical spelling; anything else (pair keys from
/// the cross-reference pass) is used verbatim.
fn canonical_key(input: &str) -> String {
    normalize_id(input).unwrap_or_else(|_| input.to_string())
}

fn cmd_stats(config: &RuntimeConfig) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.recompute_stats()?;
    println!("processed: {}", stats.processed);
    println!(
        "found:     {} (ratio {:.3})",
        stats.found,
        stats.found_ratio()
    );
    println!(
        "new:       {} (ratio {:.3})",
        stats.new_found,
        stats.new_ratio()
    );
    Ok(())
}

fn cmd_query(config: &RuntimeConfig, filter: RecordFilter) -> Result<()> {
    let store = open_store(config)?;
    let records = store.query(&filter)?;
    for record in &records {
        println!(
            "{}  cf={}  checked={}  new={}  {}",
            record.id,
            record.closed_form.as_deref().unwrap_or("-"),
            record.check_cf,
            record.is_new,
            record.name
        );
    }
    println!("{} records", records.len());
    Ok(())
}

fn cmd_show(config: &RuntimeConfig, id: &str) -> Result<()> {
    let id = normalize_id(id)?;
    let fetcher = build_fetcher(config)?;
    let payload = fetcher.fetch(&id)?;
    let parsed = raw::parse_payload(&payload)
        .with_context(|| format!("record {id} has no usable payload"))?;

    println!("{}  {}", parsed.id, parsed.name);
    println!("keywords: {}", parsed.keywords.join(","));
    println!("terms ({}): {:?}", parsed.terms.len(), parsed.terms);
    if parsed.formula_text != "[]" {
        println!("formula: {}", parsed.formula_text);
    }
    Ok(())
}
