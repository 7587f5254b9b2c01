use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use classify_tracker::{OperationTracker, TrackerConfig};

mod commands;

#[derive(Parser)]
#[command(name = "classify-track")]
#[command(about = "Track document classification jobs in real time")]
#[command(version)]
struct Cli {
    /// Base URL of the classification service (overrides CLASSIFY_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Directory holding the persisted operation snapshots (overrides CLASSIFY_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start jobs and follow their progress until they finish
    Watch {
        /// Document ids to classify
        #[arg(required = true)]
        job_ids: Vec<String>,
        /// Label recorded on every started operation
        #[arg(short, long)]
        label: Option<String>,
    },

    /// Show finished operations, most recent first
    History {
        /// Print the export JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Write history to a JSON file
    Export {
        path: PathBuf,
    },

    /// Merge a previously exported history file
    Import {
        path: PathBuf,
    },

    /// Remove every history entry
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "classify_tracker=info,classify_stream=info,classify_track=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // --- Configuration ---
    let mut config = TrackerConfig::from_env()?;
    if let Some(api_url) = cli.api_url {
        config.api_base_url = api_url;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    tracing::debug!(
        api_url = %config.api_base_url,
        state_dir = %config.state_dir.display(),
        "Loaded tracker configuration",
    );

    let tracker = OperationTracker::connect(config);

    match cli.command {
        Commands::Watch { job_ids, label } => commands::watch(&tracker, &job_ids, label).await,
        Commands::History { json } => commands::history(&tracker, json),
        Commands::Export { path } => commands::export(&tracker, &path),
        Commands::Import { path } => commands::import(&tracker, &path),
        Commands::Clear => {
            let removed = tracker.clear_history();
            println!("Removed {removed} history entries");
            Ok(ExitCode::SUCCESS)
        }
    }
}
