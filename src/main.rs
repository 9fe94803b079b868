//! # Knowledge Base Harness CLI (`kb`)
//!
//! The `kb` binary is the operator interface: it creates the database, loads
//! the initial corpus, runs sync passes against the change log, and answers
//! ad-hoc searches.
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb load` | Bulk-load the initial corpus from a JSON file |
//! | `kb sync` | Apply pending change-log entries |
//! | `kb search "<query>"` | Hybrid search over the knowledge base |
//! | `kb status` | Chunk count, vector dimensions, sync progress |
//! | `kb history` | Recent sync audit entries |
//! | `kb embed rebuild` | Re-embed every chunk with the configured provider |
//!
//! ## Examples
//!
//! ```bash
//! kb init
//! kb load --path ./data/corpus.json --dry-run
//! kb load --path ./data/corpus.json
//! kb sync
//! kb search "cost to jump" --k 3
//! kb search "phone number" --mode keyword --json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kb_harness::config;
use kb_harness::embed_cmd;
use kb_harness::ingest;
use kb_harness::kb::KnowledgeBase;
use kb_harness::migrate;
use kb_harness::search;
use kb_harness::stats;
use kb_harness::sync;

/// Knowledge Base Harness: hybrid retrieval over a versioned Q&A knowledge
/// base, kept in step with an external change log.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Knowledge Base Harness: hybrid retrieval and incremental sync for a Q&A knowledge base",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Bulk-load the initial corpus.
    Load {
        /// Corpus file; defaults to `[load] path`.
        #[arg(long)]
        path: Option<PathBuf>,

        /// Validate records without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply pending change-log entries.
    Sync {
        /// Re-read every entry regardless of the stored version.
        #[arg(long)]
        force: bool,

        /// Preview outcomes without embedding or writing.
        #[arg(long)]
        dry_run: bool,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search the knowledge base.
    Search {
        /// Query text; omit it to read queries from stdin until end of input.
        query: Option<String>,

        /// Number of results; defaults to `[retrieval] default_k`.
        #[arg(long)]
        k: Option<usize>,

        /// hybrid, semantic, or keyword.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Restrict results to one category.
        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Show store and sync status.
    Status,

    /// Show recent sync audit entries.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Embedding management.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Re-embed every chunk with the configured provider.
    Rebuild {
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "kb_harness=debug,kb_harness_core=debug"
    } else {
        "kb_harness=info,kb_harness_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let kb = KnowledgeBase::open(&cfg).await?;
    let result = match cli.command {
        Commands::Init => Ok(()),
        Commands::Load { path, dry_run } => ingest::run_load(&kb, path.as_deref(), dry_run).await,
        Commands::Sync {
            force,
            dry_run,
            json,
        } => run_sync(&kb, force, dry_run, json).await,
        Commands::Search {
            query,
            k,
            mode,
            category,
            json,
        } => search::run_search(&kb, query.as_deref(), k, &mode, category.as_deref(), json).await,
        Commands::Status => stats::run_status(&kb).await,
        Commands::History { limit } => stats::run_history(&kb, limit).await,
        Commands::Embed {
            action: EmbedAction::Rebuild { batch_size },
        } => embed_cmd::run_embed_rebuild(&kb, batch_size).await,
    };
    kb.close().await;
    result
}

async fn run_sync(kb: &KnowledgeBase, force: bool, dry_run: bool, json: bool) -> anyhow::Result<()> {
    let summary = kb.sync_with(kb.sync_options(force, dry_run)?).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        sync::print_summary(&summary);
    }
    Ok(())
}
