mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tremor",
    about = "Volcanic tremor chart pipeline: acquire, extract, store, serve and alert",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .tremor/)
    #[arg(long, global = true, env = "TREMOR_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .tremor/ with default config, subscriber file and dataset
    Init {
        /// Primary chart image URL
        #[arg(long)]
        url: Option<String>,
        /// Alternate chart used while the primary is stale
        #[arg(long)]
        fallback_url: Option<String>,
    },

    /// Run the pipeline once now
    Run,

    /// Validate and window the stored dataset, as the read API does
    Query {
        /// Number of newest rows
        #[arg(long)]
        limit: Option<usize>,
        /// Named window: 24h, 48h, 7d, 30d or all
        #[arg(long)]
        range: Option<String>,
    },

    /// Show recent pipeline runs
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Inspect and validate configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Serve the read API and run the scheduler
    Serve {
        #[arg(long, default_value_t = 3141)]
        port: u16,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } | Commands::Run => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { url, fallback_url } => {
            cmd::init::run(&root, url.as_deref(), fallback_url.as_deref())
        }
        Commands::Run => cmd::run::run(&root, cli.json),
        Commands::Query { limit, range } => cmd::query::run(&root, limit, range.as_deref(), cli.json),
        Commands::Runs { limit } => cmd::runs::run(&root, limit, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Serve { port } => cmd::serve::run(&root, port),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
