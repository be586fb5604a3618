use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "meshwarden")]
#[command(version)]
#[command(about = "Supervise a headscale coordination service and its admin channel", long_about = None)]
pub(crate) struct Cli {
    /// Config file. Can also be set via MESHWARDEN_CONFIG.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start the service (when colocated), connect, and run until interrupted
    Run,

    /// Show the latest host and service status published by `run`
    Status {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query and install service releases
    Release {
        #[command(subcommand)]
        command: ReleaseCommands,
    },

    /// Manage the administrative api key
    Apikey {
        #[command(subcommand)]
        command: ApikeyCommands,
    },

    /// Validate configuration and try the admin channel once
    Check,
}

#[derive(Subcommand)]
pub(crate) enum ReleaseCommands {
    /// List releases in the feed
    List,

    /// Show the newest release
    Latest,

    /// Install a specific release by id
    Install {
        /// Release id from `release list`
        id: u64,
    },

    /// Install the newest release
    Update,

    /// Restore the binary replaced by the last install
    Rollback {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum ApikeyCommands {
    /// Expire the current key and mint a new one (colocated only)
    Rotate,
}
