use anyhow::Context;
use dialoguer::{theme::ColorfulTheme, Confirm};
use meshwarden::app::Runtime;
use meshwarden::config::AppConfig;

use super::{build_runtime, spinner};
use crate::args::ReleaseCommands;

pub(crate) async fn cmd_release(config: AppConfig, command: ReleaseCommands) -> anyhow::Result<()> {
    let runtime = build_runtime(config).await?;
    let releases = runtime.releases();

    match command {
        ReleaseCommands::List => {
            let list = releases
                .list_releases()
                .await
                .context("Failed to fetch the release feed")?;
            if list.is_empty() {
                println!("The release feed is empty");
            }
            for release in list {
                println!(
                    "{:<12} {:<16} {} assets",
                    release.id,
                    release.tag_name,
                    release.assets.len()
                );
            }
        }
        ReleaseCommands::Latest => {
            let latest = releases.latest().await.context("Failed to fetch the release feed")?;
            println!("{} ({})", latest.tag_name, latest.id);
        }
        ReleaseCommands::Install { id } => {
            require_colocated(&runtime)?;
            let pb = spinner(&format!("Installing release {}...", id));
            let result = releases.install(id).await;
            pb.finish_and_clear();
            let release = result.with_context(|| format!("Failed to install release {}", id))?;
            println!(
                "Installed {} to {}",
                release.tag_name,
                releases.binary_path().display()
            );
        }
        ReleaseCommands::Update => {
            require_colocated(&runtime)?;
            let pb = spinner("Installing the latest release...");
            let result = releases.update().await;
            pb.finish_and_clear();
            let release = result.context("Failed to install the latest release")?;
            println!(
                "Installed {} to {}",
                release.tag_name,
                releases.binary_path().display()
            );
        }
        ReleaseCommands::Rollback { yes } => {
            require_colocated(&runtime)?;
            let path = releases.binary_path().display().to_string();
            if !yes {
                let confirmed = Confirm::with_theme(&ColorfulTheme::default())
                    .with_prompt(format!("Restore the previous binary at {}?", path))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("Rollback cancelled");
                    return Ok(());
                }
            }
            releases.rollback().context("Rollback failed")?;
            println!("Restored previous binary at {}", path);
        }
    }
    Ok(())
}

fn require_colocated(runtime: &Runtime) -> anyhow::Result<()> {
    if !runtime.deployment().is_colocated() {
        anyhow::bail!("Installing releases needs a colocated deployment");
    }
    Ok(())
}
