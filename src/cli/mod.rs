pub mod jobs;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8390;

/// Episode Pipeline - staged video generation service and client
#[derive(Parser, Debug)]
#[command(
    name = "epl",
    version,
    about = "Episode Pipeline - staged video generation service and client"
)]
pub struct Cli {
    /// Service host (client target, or bind address for `serve`)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Service port (client target, or bind port for `serve`)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn base_url(&self) -> String {
        base_url(self.host(), self.port())
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the service in the foreground until Ctrl+C
    Serve {
        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<PathBuf>,

        /// Keep jobs and logs in memory only
        #[arg(long = "in-memory")]
        in_memory: bool,
    },

    /// Create a new episode job
    Create {
        /// Episode title
        #[arg(short = 't', long)]
        title: String,

        /// Episode number (1 or greater)
        #[arg(short = 'e', long)]
        episode: u32,

        /// Pre-written script text
        #[arg(short = 's', long)]
        script: Option<String>,
    },

    /// List jobs
    List {
        /// Only jobs in this status (e.g. pending, failed, composing_video)
        #[arg(long)]
        status: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one job with its log history
    Show {
        /// Job UUID
        id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start the pipeline for a job
    Generate {
        /// Job UUID
        id: String,

        /// Run again even if the job already completed
        #[arg(long)]
        regenerate: bool,
    },

    /// Show a job's log entries, newest first
    Logs {
        /// Job UUID
        id: String,

        /// Maximum number of entries
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show per-task log statistics for a job
    Stats {
        /// Job UUID
        id: String,
    },
}

/// Build the base URL for the service HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Message shown when the service cannot be reached.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to the service at {}:{}. Is it running? (try: epl serve)",
        host, port
    )
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let client = jobs::ApiClient::new(cli.host(), cli.port());

    match &cli.command {
        Some(Commands::Serve {
            config,
            data_dir,
            in_memory,
        }) => {
            crate::daemon::start_service(
                config.as_deref(),
                data_dir.as_deref(),
                cli.host.as_deref(),
                cli.port,
                *in_memory,
            )
            .await
        }
        Some(Commands::Create {
            title,
            episode,
            script,
        }) => jobs::cmd_create(&client, title, *episode, script.as_deref()).await,
        Some(Commands::List { status, json }) => {
            jobs::cmd_list(&client, status.as_deref(), *json).await
        }
        Some(Commands::Show { id, json }) => jobs::cmd_show(&client, id, *json).await,
        Some(Commands::Generate { id, regenerate }) => {
            jobs::cmd_generate(&client, id, *regenerate).await
        }
        Some(Commands::Logs { id, limit, json }) => {
            jobs::cmd_logs(&client, id, *limit, *json).await
        }
        Some(Commands::Stats { id }) => jobs::cmd_stats(&client, id).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
