//! # Threadline CLI (`threadline`)
//!
//! ```bash
//! threadline init                    # create the database
//! threadline ingest --max-rows 500   # pull dataset rows
//! threadline chunk                   # split pending messages
//! threadline embed pending           # attach embeddings
//! threadline search "travel budget"  # query from the terminal
//! threadline serve                   # start the HTTP server
//! ```
//!
//! Logs go to stderr (`RUST_LOG`, `LOG_FORMAT=json`); command summaries go
//! to stdout.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use threadline::{
    chunk_cmd, config, embed_cmd, get, ingest, search_cmd, server, sqlite_store::SqliteStore,
    stats,
};

/// Threadline: ingest, chunk, embed, and search an email-thread dataset.
#[derive(Parser)]
#[command(name = "threadline", version)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to `./config/threadline.toml` when it exists. Environment
    /// variables (and `.env`) override file values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the SQLite database and schema. Safe to re-run.
    Init,

    /// Page through the dataset and upsert threads and messages.
    Ingest {
        /// Stop after this many rows (0 = no cap).
        #[arg(long)]
        max_rows: Option<u64>,

        /// Row offset to start from.
        #[arg(long)]
        start_offset: Option<u64>,
    },

    /// Split pending messages into chunks.
    Chunk {
        /// Mark messages pending again before chunking.
        #[arg(long)]
        reset: bool,

        /// Restrict `--reset` to one thread key.
        #[arg(long, requires = "reset")]
        thread: Option<String>,

        /// Stop after this many messages.
        #[arg(long)]
        max_messages: Option<u64>,
    },

    /// Manage chunk embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Vector search over embedded chunks.
    Search {
        query: String,

        #[arg(long)]
        top_k: Option<i64>,

        /// Only chunks of this thread key.
        #[arg(long)]
        thread: Option<String>,

        /// Only chunks of this message key.
        #[arg(long)]
        message: Option<String>,
    },

    /// Show a thread with its messages and chunks.
    Get { thread_key: String },

    /// Show corpus counts and embedding coverage.
    Stats,

    /// Start the HTTP retrieval server.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that have no vector yet.
    Pending {
        /// Maximum number of chunks to embed.
        #[arg(long)]
        limit: Option<u64>,

        /// Override `embedding.batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Only count pending chunks.
        #[arg(long)]
        dry_run: bool,
    },

    /// Drop stored vectors and embed again.
    Rebuild {
        /// Only this thread key.
        #[arg(long)]
        thread: Option<String>,
    },
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "threadline=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    if log_format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            let store = SqliteStore::open(&cfg.db.path).await?;
            store.close().await;
            println!("init {}", cfg.db.path.display());
            println!("ok");
        }
        Commands::Ingest {
            max_rows,
            start_offset,
        } => {
            ingest::run_ingest(&cfg, max_rows, start_offset).await?;
        }
        Commands::Chunk {
            reset,
            thread,
            max_messages,
        } => {
            chunk_cmd::run_chunk(&cfg, reset, thread, max_messages).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { thread } => {
                embed_cmd::run_embed_rebuild(&cfg, thread).await?;
            }
        },
        Commands::Search {
            query,
            top_k,
            thread,
            message,
        } => {
            search_cmd::run_search(&cfg, &query, top_k, thread, message).await?;
        }
        Commands::Get { thread_key } => {
            get::run_get(&cfg, &thread_key).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
