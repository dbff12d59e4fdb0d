//! Cleanroom CLI tool.

use clap::{Parser, Subcommand};
use cleanroom_config::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "cleanroom")]
#[command(about = "Cleanroom confidential job CLI", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, env = "CLEANROOM_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// API server URL
    #[arg(long, env = "CLEANROOM_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile build jobs and confidential instances into job status
    Sweep {
        /// Keep sweeping instead of exiting after one pass
        #[arg(long)]
        watch: bool,
        /// Seconds between passes (defaults to monitor.interval-secs)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Manage jobs through the API server
    Jobs {
        /// Access token sent as the Authorization header
        #[arg(long, env = "CLEANROOM_TOKEN", global = true)]
        token: Option<String>,

        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// List a creator's jobs, newest first
    List {
        #[arg(long)]
        creator: String,
        #[arg(long, default_value = "1")]
        page: i64,
        #[arg(long, default_value = "10")]
        page_size: i64,
    },
    /// Submit a workspace archive for a notebook
    Submit {
        #[arg(long)]
        creator: String,
        /// Notebook file name inside the workspace
        #[arg(long)]
        notebook: String,
        /// Path to the gzipped workspace tarball
        workspace: PathBuf,
    },
    /// Print a finished job's attestation report
    Attestation {
        #[arg(long)]
        creator: String,
        id: i64,
    },
    /// Download a job's output to a local file
    Download {
        #[arg(long)]
        creator: String,
        id: i64,
        /// Destination file (defaults to the server-side file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a job record
    Delete {
        #[arg(long)]
        creator: String,
        uuid: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sweep { watch, interval } => {
            commands::sweep::run(&cli.config, cli.api_url, watch, interval).await?;
        }
        Commands::Jobs { token, command } => {
            let client = commands::jobs::ApiClient::new(&api_url(cli.api_url)?, token)?;
            match command {
                JobCommands::List {
                    creator,
                    page,
                    page_size,
                } => commands::jobs::list(&client, &creator, page, page_size).await?,
                JobCommands::Submit {
                    creator,
                    notebook,
                    workspace,
                } => commands::jobs::submit(&client, &creator, &notebook, &workspace).await?,
                JobCommands::Attestation { creator, id } => {
                    commands::jobs::attestation(&client, &creator, id).await?
                }
                JobCommands::Download {
                    creator,
                    id,
                    output,
                } => commands::jobs::download(&client, &creator, id, output).await?,
                JobCommands::Delete { creator, uuid } => {
                    commands::jobs::delete(&client, &creator, &uuid).await?
                }
            }
        }
    }

    Ok(())
}

fn api_url(flag: Option<String>) -> anyhow::Result<url::Url> {
    let raw = flag.unwrap_or_else(|| "http://localhost:8080".to_string());
    Ok(url::Url::parse(&raw)?)
}
