// main.rs

mod client_loop;
mod dataset;
mod episode;
mod teleop;

use crate::client_loop::ClientLoop;
use crate::dataset::SqliteDataset;
use crate::episode::{EpisodeControl, RecordSettings, Recorder, spawn_key_reader};
use crate::teleop::{build_leaders, connect_leaders, disconnect_leaders};
use anyhow::Context;
use std::path::PathBuf;
use teleop_shared::config::{ClientConfig, config_path, load_config};
use teleop_shared::logging::init_tracing;
use teleop_shared::transport::TcpLink;
use tokio::sync::watch;

const DEFAULT_CONFIG_PATH: &str = "config/client.json";

fn default_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("teleop_client=info,teleop_shared=info");

    let path = config_path("TELEOP_CLIENT_CONFIG", &default_config_path());
    let cfg: ClientConfig = load_config(&path)?;
    cfg.validate()?;

    // --- Dataset ---
    let mut dataset = SqliteDataset::open(&cfg.dataset.path, cfg.dataset.jpeg_quality)
        .await
        .with_context(|| format!("failed to open dataset {}", cfg.dataset.path.display()))?;

    // --- Leaders ---
    let mut leaders = build_leaders(&cfg.units);
    connect_leaders(&mut leaders).context("failed to connect leader arms")?;

    // --- Transport ---
    let opened = TcpLink::open_client(&cfg.remote_ip, cfg.port_cmd, cfg.port_observations).await;
    let mut link = match opened {
        Ok(link) => link,
        Err(e) => {
            disconnect_leaders(&mut leaders);
            return Err(e).context("failed to open relay channels");
        }
    };
    if let Err(e) = link.wait_connected(cfg.connect_timeout(), &cfg.remote_ip).await {
        link.close();
        disconnect_leaders(&mut leaders);
        return Err(e).with_context(|| format!("host {} is not reachable", cfg.remote_ip));
    }
    tracing::info!("Connected to host {}", cfg.remote_ip);

    // --- Operator control ---
    let (control_tx, control_rx) = watch::channel(EpisodeControl::default());
    let stop_tx = control_tx.clone();
    let keys = spawn_key_reader(control_tx.clone()).context("failed to start key reader")?;
    let _signal = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, finishing current episode.");
                control_tx.send_modify(|c| c.stop = true);
            }
            Err(e) => {
                tracing::error!("cannot listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
    });

    tracing::info!("Starting network recording.");
    tracing::info!("  - Press 'n' to save the current episode and start a new one.");
    tracing::info!("  - Press 'm' or Ctrl-C to save the current episode and quit.");

    let mut client = ClientLoop::new(leaders, link);
    let mut recorder = Recorder::new(RecordSettings::from(&cfg), control_rx);
    let result = recorder.run(&mut client, &mut dataset).await;
    client.teardown();

    // The reader thread owns raw mode; wait for it so the terminal is restored.
    stop_tx.send_modify(|c| c.stop = true);
    if let Ok(Err(_)) = tokio::task::spawn_blocking(move || keys.join()).await {
        tracing::warn!("key reader thread panicked");
    }

    let summary = result?;
    tracing::info!(
        "Recorded {} episodes, {} frames ({} observation gaps, {} commands not sent)",
        summary.episodes,
        summary.frames,
        summary.gaps,
        summary.unsent_commands
    );
    Ok(())
}
