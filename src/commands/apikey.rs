use anyhow::Context;
use meshwarden::config::AppConfig;
use meshwarden::rpc::api_key_prefix;

use super::build_runtime;
use crate::args::ApikeyCommands;

pub(crate) async fn cmd_apikey(config: AppConfig, command: ApikeyCommands) -> anyhow::Result<()> {
    match command {
        ApikeyCommands::Rotate => {
            let runtime = build_runtime(config).await?;
            let key = runtime
                .rotate_api_key()
                .await
                .context("Failed to rotate the api key")?;
            println!(
                "New api key {}... saved to {}",
                api_key_prefix(&key),
                runtime.credential_store().path().display()
            );
        }
    }
    Ok(())
}
