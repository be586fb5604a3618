use meshwarden::config::{AppConfig, Controller, Deployment};
use meshwarden::rpc::{api_key_prefix, LinkStatus, TransportMode};

use super::build_runtime;

pub(crate) async fn cmd_check(config: AppConfig) -> anyhow::Result<()> {
    let runtime = build_runtime(config).await?;

    match runtime.deployment() {
        Deployment::Colocated(settings) => {
            let controller = match &settings.controller {
                Controller::Embedded => "embedded",
                Controller::Delegated { .. } => "delegated",
            };
            println!("{:<12} colocated ({})", "Deployment", controller);
            println!("{:<12} {}", "Binary", settings.app.display());
            println!("{:<12} {}", "Config", settings.config.display());
        }
        Deployment::Remote => println!("{:<12} remote", "Deployment"),
    }

    let settings = runtime.connection().settings();
    let transport = match settings.transport_mode() {
        TransportMode::Tls => "tls",
        TransportMode::Plaintext => "plaintext",
        TransportMode::Unspecified => "unspecified (plaintext)",
    };
    println!("{:<12} {}", "Target", settings.address);
    println!("{:<12} {}", "Transport", transport);
    if settings.api_key.is_empty() {
        println!("{:<12} none", "Api key");
    } else {
        println!("{:<12} {}...", "Api key", api_key_prefix(&settings.api_key));
    }

    if let Err(e) = runtime.connection().reconnect().await {
        anyhow::bail!("Admin channel check failed: {}", e);
    }
    let state = runtime.connection().state();
    if state.status == LinkStatus::Connected {
        println!("{:<12} connected", "Channel");
    }
    Ok(())
}
