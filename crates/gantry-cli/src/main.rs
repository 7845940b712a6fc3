//! gantry CLI
//!
//! Command-line interface for interacting with the gantry daemon.

mod commands;

use clap::{Parser, Subcommand};
use gantry_core::{SessionMode, SessionType};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gantry - submit sessions and inspect the scheduler
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Owner to act as
    #[arg(long, env = "GANTRY_OWNER", default_value = "cli", global = true)]
    owner: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List your sessions
    Ps,

    /// Show one session
    Get {
        /// Session ID
        id: String,
    },

    /// Create a session and queue it
    Create {
        /// Session type (image, text)
        #[arg(long = "type", default_value = "text")]
        session_type: SessionType,

        /// Session mode (inference, finetune)
        #[arg(long, default_value = "inference")]
        mode: SessionMode,

        /// Prompt for the first turn
        #[arg(long)]
        prompt: String,

        /// Model name (defaults to the catalog model for the type)
        #[arg(long)]
        model: Option<String>,

        /// Adapter to run against
        #[arg(long, default_value = "")]
        finetune_file: String,

        /// Session name
        #[arg(long, default_value = "")]
        name: String,
    },

    /// Delete a session
    Delete {
        /// Session ID
        id: String,
    },

    /// Show local model instances
    Instances,

    /// Show queue, runners and instances
    Top,

    /// Run a session directly on one runner, bypassing the queue
    Run {
        /// Base URL of the runner
        #[arg(long)]
        runner_url: String,

        /// Session type (image, text)
        #[arg(long = "type", default_value = "text")]
        session_type: SessionType,

        /// Prompt to run
        #[arg(long)]
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api, &cli.owner);

    match cli.command {
        Commands::Ps => {
            commands::ps(&client).await?;
        }
        Commands::Get { id } => {
            commands::get(&client, id).await?;
        }
        Commands::Create {
            session_type,
            mode,
            prompt,
            model,
            finetune_file,
            name,
        } => {
            commands::create(
                &client,
                commands::CreateArgs {
                    session_type,
                    mode,
                    prompt,
                    model,
                    finetune_file,
                    name,
                },
            )
            .await?;
        }
        Commands::Delete { id } => {
            commands::delete(&client, id).await?;
        }
        Commands::Instances => {
            commands::instances(&client).await?;
        }
        Commands::Top => {
            commands::top(&client).await?;
        }
        Commands::Run {
            runner_url,
            session_type,
            prompt,
        } => {
            commands::run(&client, &runner_url, session_type, prompt).await?;
        }
    }

    Ok(())
}
