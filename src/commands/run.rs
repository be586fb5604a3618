use meshwarden::app::shutdown_signal;
use meshwarden::config::AppConfig;
use tracing::info;

use super::build_runtime;

pub(crate) async fn cmd_run(config: AppConfig) -> anyhow::Result<()> {
    let runtime = build_runtime(config).await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        colocated = runtime.deployment().is_colocated(),
        "meshwarden starting"
    );
    runtime.run_until(shutdown_signal()).await;
    Ok(())
}
