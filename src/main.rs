mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use meshwarden::clienv;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(clienv::config_path);
    let config = commands::load_config(&config_path)?;

    let filter = clienv::log_filter().unwrap_or_else(|| config.log.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run => commands::run::cmd_run(config).await?,
        Commands::Status { json } => commands::status::cmd_status(json).await?,
        Commands::Release { command } => commands::release::cmd_release(config, command).await?,
        Commands::Apikey { command } => commands::apikey::cmd_apikey(config, command).await?,
        Commands::Check => commands::check::cmd_check(config).await?,
    }

    Ok(())
}
