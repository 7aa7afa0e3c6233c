// triedex CLI - build, query and serve a bounded prefix-search index
use anyhow::Result;
use clap::{Parser, Subcommand};

// Macro for conditional printing based on quiet flag
macro_rules! qprintln {
    ($quiet:expr, $($arg:tt)*) => {
        if !$quiet {
            println!($($arg)*);
        }
    };
}
use triedex::observability::OperationContext;
use triedex::{
    build_index_files, init_logging_with_level, load_trie, log_error_with_context, start_server,
    with_trace_id, AppState, CsvRecordSource, IndexError, LogRecordStore, ProductTitleTokenizer,
    QueryEngine, RecordStore, Settings, Tokenizer,
};

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "triedex - bounded-memory prefix search for short text records",
    long_about = None,
    after_help = "QUICK START:
  1. Build an index:          triedex build --catalogue products.csv
  2. Query it:                triedex query 'blue tank'
  3. Serve it over HTTP:      triedex serve --port 3812

EXAMPLES:
  # Index the second column of a catalogue, clamping lexemes to 8 characters
  triedex build --catalogue products.csv --column 1 --max-lexeme-length 8

  # Show how a query was planned
  triedex query 'tankini' --explain

  # Inspect the persisted trie
  triedex stats --json"
)]
struct Cli {
    /// Enable verbose logging (DEBUG level). Default is WARN level.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress everything except results and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Settings file (TOML)
    #[arg(short, long, global = true, env = "TRIEDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Trie file path
    #[arg(long, global = true, env = "TRIEDEX_TRIE_PATH")]
    trie_path: Option<PathBuf>,

    /// Record store path
    #[arg(long, global = true, env = "TRIEDEX_RECORD_STORE_PATH")]
    record_store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the trie and the record store from a CSV catalogue
    Build {
        /// CSV catalogue to index
        #[arg(long, env = "TRIEDEX_CATALOGUE")]
        catalogue: Option<PathBuf>,
        /// Zero-based column holding the record text
        #[arg(long)]
        column: Option<usize>,
        /// Skip the first row of the catalogue
        #[arg(long)]
        headers: bool,
        /// Maximum lexeme length in characters
        #[arg(long)]
        max_lexeme_length: Option<usize>,
        /// Maximum number of identifiers per trie node
        #[arg(long)]
        max_bucket_length: Option<usize>,
    },

    /// Run a query against a built index
    Query {
        /// Free-text query
        query: String,
        /// Maximum number of results to print
        #[arg(short, long)]
        limit: Option<usize>,
        /// Print how each lexeme was looked up
        #[arg(long)]
        explain: bool,
    },

    /// Start HTTP REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "TRIEDEX_PORT")]
        port: Option<u16>,
    },

    /// Show statistics for the persisted trie
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Process exit code for a failure, by its typed root cause
fn exit_code(err: &anyhow::Error) -> i32 {
    match IndexError::classify(err) {
        Some(IndexError::Input(_)) => 2,
        Some(IndexError::Storage(_)) => 3,
        Some(IndexError::Persistence(_)) => 4,
        Some(IndexError::Lifecycle(_)) => 5,
        Some(IndexError::Cancelled(_)) => 130,
        None => 1,
    }
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, shutting down");
            token.cancel();
        }
    });
}

async fn build(
    settings: &Settings,
    headers: bool,
    quiet: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let catalogue = settings
        .catalogue_path
        .clone()
        .ok_or_else(|| IndexError::Input("no catalogue given (--catalogue)".to_string()))?;
    let config = settings.index_config(Arc::new(ProductTitleTokenizer::new()))?;

    let source = CsvRecordSource::new(&catalogue, settings.catalogue_column).with_headers(headers);
    let (report, size_bytes) = build_index_files(
        Box::new(source),
        config,
        &settings.trie_path,
        &settings.record_store_path,
        cancel,
    )
    .await?;

    qprintln!(quiet, "Indexed {} records from {}", report.records, catalogue.display());
    qprintln!(
        quiet,
        "  lexemes: {} ({} truncated)",
        report.lexemes,
        report.truncated_lexemes
    );
    qprintln!(
        quiet,
        "  nodes: {}, saturated buckets: {}",
        report.stats.nodes,
        report.stats.saturated_buckets
    );
    qprintln!(
        quiet,
        "  trie: {} ({} bytes), records: {}",
        settings.trie_path.display(),
        size_bytes,
        settings.record_store_path.display()
    );
    qprintln!(quiet, "  elapsed: {:?}", report.elapsed);
    Ok(())
}

/// Load the persisted trie and open the record store as a query engine
async fn open_engine(settings: &Settings) -> Result<QueryEngine> {
    let loaded = load_trie(&settings.trie_path).await?;
    if loaded.max_lexeme_length.get() != settings.max_lexeme_length
        || loaded.max_bucket_length.get() != settings.max_bucket_length
    {
        info!(
            lexeme = loaded.max_lexeme_length.get(),
            bucket = loaded.max_bucket_length.get(),
            "Using the limits recorded in the trie file"
        );
    }

    let tokenizer: Arc<dyn Tokenizer> = Arc::new(ProductTitleTokenizer::new());
    let config = loaded.index_config(tokenizer)?;
    let store: Arc<dyn RecordStore> =
        Arc::new(LogRecordStore::open(&settings.record_store_path).await?);
    Ok(QueryEngine::new(Arc::new(loaded.trie), store, config))
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let quiet = cli.quiet;
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(path) = cli.trie_path {
        settings.trie_path = path;
    }
    if let Some(path) = cli.record_store_path {
        settings.record_store_path = path;
    }

    match cli.command {
        Commands::Build {
            catalogue,
            column,
            headers,
            max_lexeme_length,
            max_bucket_length,
        } => {
            if let Some(path) = catalogue {
                settings.catalogue_path = Some(path);
            }
            if let Some(column) = column {
                settings.catalogue_column = column;
            }
            if let Some(len) = max_lexeme_length {
                settings.max_lexeme_length = len;
            }
            if let Some(len) = max_bucket_length {
                settings.max_bucket_length = len;
            }
            settings.validate()?;
            build(&settings, headers, quiet, cancel).await?;
        }

        Commands::Query {
            query,
            limit,
            explain,
        } => {
            let engine = open_engine(&settings).await?;
            let outcome = engine.query(&query, &cancel).await?;

            if explain {
                for plan in &outcome.plan {
                    let overflow = match plan.overflow {
                        Some(reason) => format!("{reason:?}").to_lowercase(),
                        None => "-".to_string(),
                    };
                    qprintln!(
                        quiet,
                        "  {:<16} path={:<12} bucket={:<6} overflow={}",
                        plan.lexeme,
                        plan.path,
                        plan.bucket_len,
                        overflow
                    );
                }
                qprintln!(
                    quiet,
                    "  {} candidates, {} results{}",
                    outcome.candidates,
                    outcome.results.len(),
                    if outcome.union_fallback {
                        " (union fallback)"
                    } else {
                        ""
                    }
                );
            }

            let limit = limit.unwrap_or(settings.result_limit);
            for text in outcome.results.iter().take(limit) {
                println!("{text}");
            }
            if outcome.results.len() > limit {
                qprintln!(quiet, "... {} more", outcome.results.len() - limit);
            }
        }

        Commands::Serve { port } => {
            let port = port.unwrap_or(settings.port);
            let engine = Arc::new(open_engine(&settings).await?);
            let state = AppState::new(engine, settings.result_limit, cancel);

            qprintln!(quiet, "Starting triedex HTTP server on port {port}");
            qprintln!(quiet, "API endpoints:");
            qprintln!(quiet, "   GET    /search/:query  - Search (?limit=&explain=)");
            qprintln!(quiet, "   GET    /stats          - Index statistics");
            qprintln!(quiet, "   GET    /metrics        - Operation counters");
            qprintln!(quiet, "   GET    /health         - Health check");

            start_server(state, port).await?;
        }

        Commands::Stats { json } => {
            let loaded = load_trie(&settings.trie_path).await?;
            let stats = loaded.trie.stats(loaded.max_bucket_length);
            if json {
                let value = serde_json::json!({
                    "path": settings.trie_path.display().to_string(),
                    "size_bytes": loaded.size_bytes,
                    "max_lexeme_length": loaded.max_lexeme_length.get(),
                    "max_bucket_length": loaded.max_bucket_length.get(),
                    "stats": stats,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Trie: {} ({} bytes)", settings.trie_path.display(), loaded.size_bytes);
                println!(
                    "  max lexeme length: {}, max bucket length: {}",
                    loaded.max_lexeme_length.get(),
                    loaded.max_bucket_length.get()
                );
                println!("  nodes: {}, max depth: {}", stats.nodes, stats.max_depth);
                println!(
                    "  bucket entries: {}, saturated buckets: {}",
                    stats.bucket_entries, stats.saturated_buckets
                );
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    // Parse CLI args first to get verbose flag
    let cli = Cli::parse();

    // Ignore error if already initialized
    let _ = init_logging_with_level(cli.verbose, cli.quiet);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = with_trace_id("triedex-cli", run(cli, cancel)).await;
    if let Err(err) = result {
        log_error_with_context(&err, &OperationContext::new("triedex-cli"));
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}
