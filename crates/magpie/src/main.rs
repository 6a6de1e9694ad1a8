mod commands;
mod config;

use clap::{Parser, Subcommand};
use magpie_core::MagpieError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "magpie")]
#[command(about = "Federated librarian for scientific data", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/magpie/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the librarian server (ingest HTTP, optionally background tasks)
    Server {
        /// Generate default configuration file
        #[arg(long)]
        init_config: bool,

        /// Background task configuration; when set, the scheduler runs in
        /// this process alongside ingest
        #[arg(long)]
        background_config: Option<PathBuf>,
    },

    /// Run only the background task scheduler (background-only deployment)
    Background {
        /// Background task configuration
        #[arg(long)]
        background_config: PathBuf,
    },

    /// Inspect files
    #[command(subcommand)]
    File(FileCommands),

    /// Inspect stores
    #[command(subcommand)]
    Store(StoreCommands),

    /// Inspect the send queue
    #[command(subcommand)]
    Queue(QueueCommands),
}

#[derive(Subcommand)]
enum FileCommands {
    /// List recently uploaded files
    List {
        /// Maximum rows to print
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },

    /// Show a file's metadata and every known copy
    Info {
        /// File name
        name: String,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// List stores with capacity and state
    List,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show send queue counts by status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "magpie=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Server {
            init_config,
            background_config,
        } => {
            if init_config {
                commands::server::init_config(&cli.config).await
            } else {
                commands::server::run(&cli.config, background_config.as_deref()).await
            }
        }
        Commands::Background { background_config } => {
            commands::background::run(&cli.config, &background_config).await
        }
        Commands::File(cmd) => match cmd {
            FileCommands::List { limit } => commands::admin::file_list(&cli.config, limit).await,
            FileCommands::Info { name } => commands::admin::file_info(&cli.config, &name).await,
        },
        Commands::Store(cmd) => match cmd {
            StoreCommands::List => commands::admin::store_list(&cli.config).await,
        },
        Commands::Queue(cmd) => match cmd {
            QueueCommands::Status => commands::admin::queue_status(&cli.config).await,
        },
    }
}

/// 0 success, 2 configuration error, 3 database unreachable, 4 unknown task
/// kind; everything else is a generic failure.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(magpie) = cause.downcast_ref::<MagpieError>() {
            return match magpie {
                MagpieError::UnknownTaskKind(_) => 4,
                MagpieError::InvalidConfig(_) | MagpieError::Parse(_) => 2,
                MagpieError::Database(_) => 3,
                _ => 1,
            };
        }
        if cause.downcast_ref::<toml::de::Error>().is_some() {
            return 2;
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            // Unreadable config files are configuration errors.
            return 2;
        }
    }
    1
}
