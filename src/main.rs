//! # SmoothBrain CLI (`smoothbrain`)
//!
//! ## Usage
//!
//! ```bash
//! smoothbrain --config ./config/smoothbrain.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `smoothbrain init` | Create the SQLite card store and run schema migrations |
//! | `smoothbrain sync` | Fetch new highlights and generate flashcards |
//! | `smoothbrain regenerate <id>` | Re-run generation for one card |
//! | `smoothbrain undo` | Revert the most recent sync or regenerate |
//! | `smoothbrain stats` | Show card counts and sync status |
//! | `smoothbrain export` | Write completed cards as Anki-importable TSV |
//! | `smoothbrain completions <shell>` | Print a shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! # First sync, capped while trying things out
//! smoothbrain sync --limit 5
//!
//! # See what the next sync would do without writing anything
//! smoothbrain sync --dry-run
//!
//! # Give cards that failed last time another go
//! smoothbrain sync --retry-failed
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use smoothbrain::completion::OpenAiClient;
use smoothbrain::config::{self, Config};
use smoothbrain::progress::{format_number, CancelFlag, ProgressMode};
use smoothbrain::readwise::ReadwiseClient;
use smoothbrain::sqlite_store::SqliteStore;
use smoothbrain::sync::{EngineSettings, RunOptions, SyncEngine, SyncReport};
use smoothbrain::{db, export, logging, migrate, stats};
use smoothbrain_core::store::CardStore;

/// SmoothBrain: flashcards from your reading highlights.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/smoothbrain.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "smoothbrain",
    about = "Turn read-it-later highlights into spaced-repetition flashcards",
    version,
    long_about = "SmoothBrain fetches highlights from Readwise, asks a language model for one \
    question/answer pair per highlight, and keeps the resulting cards in a local SQLite deck \
    that can be exported to Anki."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/smoothbrain.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the card store.
    ///
    /// Creates the SQLite database and all tables. Running it again is safe.
    Init,

    /// Fetch new highlights and generate flashcards.
    ///
    /// Only documents updated since the last successful sync are fetched.
    /// Cards left pending by an earlier interrupted run are retried
    /// automatically. Ctrl-C stops after the in-flight requests finish.
    Sync {
        /// Ignore the watermark and fetch every highlight.
        #[arg(long)]
        full: bool,

        /// Process at most this many documents (after filtering).
        #[arg(long)]
        limit: Option<usize>,

        /// Also re-submit cards whose generation failed.
        #[arg(long)]
        retry_failed: bool,

        /// Show what would be created and generated without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-run generation for one card, whatever its current state.
    Regenerate {
        /// Highlight id the card was created from.
        highlight_id: String,
    },

    /// Revert the most recent sync or regenerate as one unit.
    Undo,

    /// Show card counts per state and sync status.
    Stats,

    /// Export completed cards as Anki-importable TSV.
    Export {
        /// Output file. Writes to stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Print a shell completion script to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // No config needed
    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(
            shell,
            &mut Cli::command(),
            "smoothbrain",
            &mut std::io::stdout(),
        );
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let _log_guard = logging::init_logging(&cfg.logging)?;
    let mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Card store initialized at {}.", cfg.db.path.display());
        }
        Commands::Sync {
            full,
            limit,
            retry_failed,
            dry_run,
        } => {
            let options = RunOptions {
                full,
                limit: cfg.document_limit(limit),
                retry_failed,
                dry_run,
            };
            let (engine, store) = build_engine(&cfg).await?;
            let cancel = CancelFlag::new();
            cancel.cancel_on_ctrl_c();
            let progress = mode.sink(cancel);

            let result = engine.run(&options, progress.as_ref()).await;
            store.pool().close().await;
            print_report(&result?, mode);
        }
        Commands::Regenerate { highlight_id } => {
            let (engine, store) = build_engine(&cfg).await?;
            let cancel = CancelFlag::new();
            cancel.cancel_on_ctrl_c();
            let progress = mode.sink(cancel);

            let result = engine.regenerate(&highlight_id, progress.as_ref()).await;
            store.pool().close().await;
            let card = result?;
            println!("Card {} is now {}.", card.highlight_id, card.state);
            if !card.question.is_empty() {
                println!("  Q: {}", card.question);
                println!("  A: {}", card.answer);
            }
        }
        Commands::Undo => {
            let store = open_store(&cfg).await?;
            let undone = store.undo_last().await;
            store.pool().close().await;
            match undone? {
                Some(summary) => println!(
                    "Undid \"{}\" ({} change{}).",
                    summary.label,
                    format_number(summary.reverted_ops as u64),
                    if summary.reverted_ops == 1 { "" } else { "s" }
                ),
                None => println!("Nothing to undo."),
            }
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Export { output } => {
            export::run_export(&cfg, output.as_deref()).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

async fn build_engine(cfg: &Config) -> Result<(SyncEngine, Arc<SqliteStore>)> {
    let source = Arc::new(ReadwiseClient::from_config(cfg)?);
    let client = Arc::new(OpenAiClient::from_config(cfg)?);
    let store = open_store(cfg).await?;
    let engine = SyncEngine::new(
        store.clone(),
        source,
        client,
        EngineSettings::from_config(cfg),
    );
    Ok((engine, store))
}

fn print_report(report: &SyncReport, mode: ProgressMode) {
    if mode == ProgressMode::Json {
        if let Ok(line) = serde_json::to_string(report) {
            println!("{}", line);
        }
        return;
    }

    let n = |v: usize| format_number(v as u64);
    if report.dry_run {
        println!("Dry run (nothing written)");
    } else if report.cancelled {
        println!("Sync cancelled");
    } else {
        println!("Sync complete");
    }
    println!(
        "  documents:   {} fetched, {} kept",
        n(report.documents_fetched),
        n(report.documents_kept)
    );
    println!(
        "  highlights:  {} seen, {} new, {} already carded",
        n(report.highlights_seen),
        n(report.cards_created),
        n(report.cards_existing)
    );
    if report.dry_run {
        println!("  would generate: {}", n(report.dispatched));
        return;
    }
    if report.retried_failed > 0 {
        println!("  retried:     {} failed cards", n(report.retried_failed));
    }
    println!(
        "  generated:   {} completed, {} suspended, {} failed, {} left pending",
        n(report.completed),
        n(report.suspended),
        n(report.failed),
        n(report.left_pending)
    );
    match report.new_watermark {
        Some(at) => println!("  watermark:   {}", at.to_rfc3339()),
        None => println!("  watermark:   unchanged"),
    }
}
