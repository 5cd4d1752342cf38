use anyhow::{Context, Result};
use facewatch_core::Settings;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;
mod preview;
mod status;

use engine::{EngineEvent, EngineState, OnnxComponents, StopReason};
use preview::PreviewSink;
use status::MonitorStatus;

/// Engine → daemon channel depth; frame updates beyond this are dropped.
const EVENT_BUFFER: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let settings = Settings::from_env();
    let config = settings.recognition().context("invalid configuration")?;
    tracing::info!(
        source = %config.source,
        known_faces = %config.known_faces_dir.display(),
        threshold = config.threshold,
        cooldown_secs = config.unknown_cooldown.as_secs_f64(),
        "configuration loaded"
    );

    let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
    let (status_tx, status_rx) = watch::channel(MonitorStatus::new(config.source.clone()));

    let engine = engine::spawn_engine(config, OnnxComponents, event_tx).context("failed to start engine")?;
    let stop = engine.stop_handle();

    // Held for the lifetime of the daemon; dropping it releases the bus name.
    let _dbus = if settings.dbus_enabled {
        let service = dbus_interface::MonitorService::new(status_rx, stop.clone());
        match dbus_interface::register(service).await {
            Ok(conn) => {
                tracing::info!(name = dbus_interface::BUS_NAME, "D-Bus interface registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus registration failed; continuing without control surface");
                None
            }
        }
    } else {
        tracing::info!("D-Bus disabled via FACEWATCH_DBUS=0");
        None
    };

    let preview = settings.preview_path.clone().map(PreviewSink::new);

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(EngineEvent::State(state)) => {
                    tracing::info!(state = state.name(), "engine state changed");
                    if state == EngineState::Running {
                        tracing::info!("facewatchd ready");
                    }
                    status_tx.send_modify(|s| s.state = state);
                }
                Some(EngineEvent::Frame(update)) => {
                    if let Some(event) = &update.logged {
                        tracing::info!(path = %event.image_path.display(), "unknown face recorded");
                    }
                    status_tx.send_modify(|s| s.record_frame(&update));
                    if let Some(sink) = &preview {
                        sink.offer(update.annotated);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("facewatchd shutting down");
                stop.stop();
            }
        }
    }

    let reason = tokio::task::spawn_blocking(move || engine.join())
        .await
        .context("engine join task failed")?;
    if let Some(sink) = &preview {
        tracing::debug!(dropped = sink.dropped(), "preview frames dropped");
    }

    if let StopReason::Error(msg) = &reason {
        anyhow::bail!("engine stopped: {msg}");
    }
    tracing::info!(reason = ?reason, "facewatchd stopped");
    Ok(())
}
