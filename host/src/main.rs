// main.rs

mod actuator;
mod host_loop;
mod sim;
mod watchdog;

use crate::actuator::{connect_all, disconnect_all};
use crate::host_loop::{HostLoop, LoopSettings};
use anyhow::Context;
use std::path::PathBuf;
use std::time::Instant;
use teleop_shared::config::{HostConfig, SafeAction, config_path, load_config};
use teleop_shared::logging::init_tracing;
use teleop_shared::transport::TcpLink;
use tokio::sync::watch;

const DEFAULT_CONFIG_PATH: &str = "config/host.json";

fn default_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("teleop_host=info,teleop_shared=info");

    let path = config_path("TELEOP_HOST_CONFIG", &default_config_path());
    let cfg: HostConfig = load_config(&path)?;
    cfg.validate()?;
    if let SafeAction::Idle { targets } = &cfg.safe_action {
        tracing::warn!(
            "safe_action is idle: every tick without a fresh command drives units to {targets:?}"
        );
    }

    // --- Devices ---
    let mut units = sim::build_units(&cfg);
    connect_all(&mut units).context("failed to connect units")?;

    // --- Transport ---
    let opened = TcpLink::open_host(cfg.bind_address, cfg.port_cmd, cfg.port_observations).await;
    let link = match opened {
        Ok(link) => link,
        Err(e) => {
            disconnect_all(&mut units);
            return Err(e).context("failed to open relay channels");
        }
    };

    // --- Shutdown signal ---
    let (stop_tx, stop_rx) = watch::channel(false);
    let _signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, stopping after this tick.");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                tracing::error!("cannot listen for Ctrl-C: {e}");
                // Keep the sender alive so the loop is not stopped by a drop.
                std::future::pending::<()>().await;
            }
        }
    });

    let mut host = HostLoop::new(units, link, LoopSettings::from(&cfg), Instant::now());
    host.run(stop_rx).await;
    host.teardown();
    Ok(())
}
