//! # vidgraph CLI
//!
//! ```bash
//! vidgraph --config ./config/vidgraph.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vidgraph init` | Create the SQLite database and run schema migrations |
//! | `vidgraph serve` | Start the HTTP API (resumes unfinished jobs first) |
//! | `vidgraph ingest <file>` | Stage a local file and run the pipeline |
//! | `vidgraph status <id>` | Show one job |
//! | `vidgraph jobs` | List recent jobs |
//! | `vidgraph extract <file>` | Print the delta a file would produce |
//! | `vidgraph graph show` | Graph counts and a bounded snapshot |
//! | `vidgraph graph node <key>` | One node |
//! | `vidgraph graph neighbors <key>` | Relationships of a node |
//! | `vidgraph graph label <label>` | Nodes with a label |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use vidgraph::{config, ingest_cmd, migrate, query, server};

#[derive(Parser)]
#[command(
    name = "vidgraph",
    about = "vidgraph: ingest video uploads into a property graph",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vidgraph.toml")]
    config: PathBuf,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Submit a local video file.
    Ingest {
        /// File to upload.
        file: PathBuf,

        /// Declared content type; inferred from the extension when omitted.
        #[arg(long)]
        content_type: Option<String>,

        /// Wait for the job to finish and print its final state.
        #[arg(long)]
        wait: bool,
    },

    /// Show a job by id.
    Status {
        /// Job UUID.
        id: String,
    },

    /// List recent jobs, newest first.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Run the configured extractor on a file and print the delta as JSON.
    ///
    /// Nothing is staged or written.
    Extract {
        file: PathBuf,

        #[arg(long)]
        content_type: Option<String>,
    },

    /// Inspect the graph.
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },
}

#[derive(Subcommand)]
enum GraphAction {
    /// Node and relationship counts plus a bounded snapshot.
    Show {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// A node by natural key (e.g. `container:webm`).
    Node { key: String },
    /// Every relationship touching a node.
    Neighbors { key: String },
    /// Nodes with a label (e.g. `Codec`).
    Label {
        label: String,

        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// Only nodes whose PROPERTY equals --value
        #[arg(long, requires = "value")]
        property: Option<String>,

        #[arg(long, requires = "property")]
        value: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest {
            file,
            content_type,
            wait,
        } => {
            ingest_cmd::run_ingest(&cfg, &file, content_type.as_deref(), wait).await?;
        }
        Commands::Status { id } => {
            ingest_cmd::run_status(&cfg, &id).await?;
        }
        Commands::Jobs { limit } => {
            ingest_cmd::run_jobs(&cfg, limit).await?;
        }
        Commands::Extract { file, content_type } => {
            ingest_cmd::run_extract(&cfg, &file, content_type.as_deref()).await?;
        }
        Commands::Graph { action } => match action {
            GraphAction::Show { limit } => query::run_graph_show(&cfg, limit).await?,
            GraphAction::Node { key } => query::run_graph_node(&cfg, &key).await?,
            GraphAction::Neighbors { key } => query::run_graph_neighbors(&cfg, &key).await?,
            GraphAction::Label {
                label,
                limit,
                property,
                value,
            } => {
                let filter = property.as_deref().zip(value.as_deref());
                query::run_graph_label(&cfg, &label, filter, limit).await?
            }
        },
    }

    Ok(())
}
