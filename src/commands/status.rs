use anyhow::Context;
use meshwarden::app::Environment;
use meshwarden::status::{StatusFile, StatusSnapshot};
use std::time::Duration;

/// How long to wait for `run` to notice a first reader.
const FIRST_READ_WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(250);

pub(crate) async fn cmd_status(json: bool) -> anyhow::Result<()> {
    let file = StatusFile::new(Environment::from_process().status_path());

    let mut snapshot = file.read();
    let mut waited = Duration::ZERO;
    while snapshot.is_none() && waited < FIRST_READ_WAIT {
        tokio::time::sleep(POLL).await;
        waited += POLL;
        snapshot = file.read();
    }

    let Some(snapshot) = snapshot else {
        anyhow::bail!(
            "No status at {}. Is `meshwarden run` active?",
            file.path().display()
        );
    };

    if json {
        let rendered = serde_json::to_string_pretty(&snapshot).context("Failed to render status")?;
        println!("{}", rendered);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

fn print_snapshot(s: &StatusSnapshot) {
    let host = &s.host;
    let service = serde_json::to_value(s.service)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    println!("{:<12} {}", "Taken", s.taken_at.to_rfc3339());
    println!("{:<12} {}", "Service", service);
    println!("{:<12} {}", "Version", s.version);
    if let Some(latest) = &s.latest_version {
        println!("{:<12} {}", "Latest", latest);
    }
    if let Some(err) = &s.last_error {
        println!("{:<12} {}", "Error", err);
    }
    println!("{:<12} {:.1}%", "CPU", host.cpu_percent);
    println!(
        "{:<12} {} / {}",
        "Memory",
        human_bytes(host.memory_used),
        human_bytes(host.memory_total)
    );
    println!(
        "{:<12} {} free of {}",
        "Disk",
        human_bytes(host.disk_available),
        human_bytes(host.disk_total)
    );
    println!(
        "{:<12} {:.2} {:.2} {:.2}",
        "Load", host.load_one, host.load_five, host.load_fifteen
    );
    println!(
        "{:<12} rx {}/s  tx {}/s",
        "Network",
        human_bytes(host.net_received_rate as u64),
        human_bytes(host.net_transmitted_rate as u64)
    );
    println!("{:<12} {}s", "Uptime", host.uptime_secs);

    if !s.log_tail.is_empty() {
        println!();
        println!("Recent service output:");
        for line in &s.log_tail {
            println!("  {}", line);
        }
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
