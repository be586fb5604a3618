pub(crate) mod apikey;
pub(crate) mod check;
pub(crate) mod release;
pub(crate) mod run;
pub(crate) mod status;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use meshwarden::app::{Environment, Runtime};
use meshwarden::config::AppConfig;
use std::path::Path;
use std::time::Duration;

pub(crate) fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    AppConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
}

pub(crate) async fn build_runtime(config: AppConfig) -> anyhow::Result<Runtime> {
    Runtime::build(config, Environment::from_process())
        .await
        .context("Invalid configuration")
}

pub(crate) fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
