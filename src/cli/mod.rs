pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::ScraperConfig;
use crate::crawler::task::JobSpec;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging for this crate
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file; without a path, the platform data directory is used
    #[arg(long, global = true, num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add one scrape job to the queue
    Enqueue {
        /// Search keyword
        #[arg(short, long, required_unless_present = "url")]
        keyword: Option<String>,

        /// Direct listing URL; wins over the keyword
        #[arg(short, long)]
        url: Option<String>,

        /// Maximum result pages to visit
        #[arg(short, long)]
        max_pages: Option<u32>,

        /// Lower values are claimed first
        #[arg(short, long, allow_hyphen_values = true)]
        priority: Option<i32>,

        /// Delay before the job becomes eligible, in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
    },

    /// Add jobs from a file: a JSON array of specs or one keyword/URL per line
    EnqueueBulk {
        #[arg(required = true)]
        file: PathBuf,

        /// Page limit for entries that do not set one
        #[arg(short, long)]
        max_pages: Option<u32>,

        /// Priority for entries that do not set one
        #[arg(short, long, allow_hyphen_values = true)]
        priority: Option<i32>,
    },

    /// Claim and run jobs until interrupted
    Worker {
        /// Jobs run at the same time
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },

    /// Start the browser pool, run one trivial task and shut down
    DryRun,

    /// Show the number of jobs in each state
    Counts,

    /// Show everything the queue knows about a job
    Job {
        #[arg(required = true)]
        id: String,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    if let Commands::Config { init: true } = cli.command {
        info!("Writing default configuration");
        return commands::init_config(cli.config);
    }

    let config = ScraperConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enqueue {
            keyword,
            url,
            max_pages,
            priority,
            delay_ms,
        } => {
            let spec = JobSpec {
                keyword,
                url,
                max_pages,
                priority,
                delay_ms,
            };
            commands::enqueue(config, spec).await
        }
        Commands::EnqueueBulk { file, max_pages, priority } => {
            info!("Enqueueing jobs from {}", file.display());
            commands::enqueue_bulk(config, file, max_pages, priority).await
        }
        Commands::Worker { concurrency } => {
            info!("Starting worker");
            commands::worker(config, concurrency).await
        }
        Commands::DryRun => {
            info!("Running dry run");
            commands::dry_run(config).await
        }
        Commands::Counts => commands::counts(config).await,
        Commands::Job { id } => commands::job(config, id).await,
        Commands::Config { .. } => commands::show_config(&config),
    }
}
