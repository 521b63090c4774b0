//! Agenthub CLI - manages AI development command-line tools.
//!
//! This is the main binary entry point. See the `agenthub` library for the
//! core functionality; long-lived work happens in the background helper
//! (`agenthub helper`).

use anyhow::Result;
use agenthub::{commands, Config, Helper, Platform};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// mimalloc provides better multi-threaded performance than the system
/// allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Desktop manager for AI development CLI tools.
#[derive(Parser, Debug)]
#[command(name = "agenthub", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background helper in the foreground.
    Helper,
    /// Show helper status.
    Status,
    /// List agents known to the helper.
    List,
    /// Show one agent.
    Show {
        /// Agent id (e.g. claude-code).
        agent: String,
    },
    /// Install an agent.
    Install {
        /// Agent id to install.
        agent: String,
        /// Preferred install method (e.g. npm, brew).
        #[arg(long)]
        method: Option<String>,
        /// Install system-wide rather than per-user.
        #[arg(long)]
        global: bool,
    },
    /// Update an installed agent.
    Update {
        /// Agent id to update.
        agent: String,
    },
    /// Uninstall an agent.
    Uninstall {
        /// Agent id to remove.
        agent: String,
    },
    /// Refresh the agent catalog.
    Refresh,
    /// Check installed agents for available updates.
    CheckUpdates,
    /// Ask a running helper to shut down (best-effort).
    Stop,
    /// Print helper notifications as they arrive.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let platform = Platform::new()?;
    let config = Config::load(&platform)?;

    match cli.command {
        Command::Helper => Helper::new(platform, config).run().await,
        Command::Status => commands::status(&platform, &config).await,
        Command::List => commands::list(&platform, &config).await,
        Command::Show { agent } => commands::show(&platform, &config, &agent).await,
        Command::Install {
            agent,
            method,
            global,
        } => commands::install(&platform, &config, &agent, method, global).await,
        Command::Update { agent } => commands::update(&platform, &config, &agent).await,
        Command::Uninstall { agent } => commands::uninstall(&platform, &config, &agent).await,
        Command::Refresh => commands::refresh(&platform, &config).await,
        Command::CheckUpdates => commands::check_updates(&platform, &config).await,
        Command::Stop => commands::stop(&platform, &config).await,
        Command::Watch => commands::watch(&platform, &config).await,
    }
}
