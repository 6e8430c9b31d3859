//! Microphone node
//!
//! Advertises on the network and streams the default microphone to whichever
//! peer asks for it, until Ctrl+C.
//!
//! Usage: `sender [config.toml]`

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peer_mic_streamer::{
    audio::{list_input_devices, CpalCapture, WavSinkOpener},
    config::AppConfig,
    network::{tcp::TcpSettings, PeerId, TcpTransport},
    session::{SessionCommand, SessionController, SessionSettings, UiEvent},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting microphone node");

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::from_file(&path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => AppConfig::load()?,
    };

    println!("\n=== Available Input Devices ===");
    for device in list_input_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let (event_tx, event_rx) = unbounded();
    let local = PeerId::new(config.peer.display_name.clone());
    let transport = TcpTransport::new(local, TcpSettings::from_config(&config.network)?, event_tx);

    let (ui_tx, ui_rx) = unbounded();
    let controller = SessionController::new(
        Box::new(transport),
        Box::new(CpalCapture::new(None)),
        Box::new(WavSinkOpener),
        SessionSettings::from_config(&config),
    )
    .with_ui(ui_tx);

    let (command_tx, command_rx) = unbounded();
    command_tx.send(SessionCommand::Advertise)?;

    let session = tokio::task::spawn_blocking(move || controller.run(event_rx, command_rx));
    let ui = tokio::task::spawn_blocking(move || {
        for event in ui_rx {
            match event {
                UiEvent::StateChanged(state) => println!("State: {}", state),
                UiEvent::OpenStreamingView { requested_by } => println!(
                    "Streaming microphone to {}",
                    requested_by.as_deref().unwrap_or("peer")
                ),
                UiEvent::CloseStreamingView => println!("Streaming stopped"),
                UiEvent::RecordingFinished { path } => println!("Recording saved to {}", path.display()),
            }
        }
    });

    tracing::info!(port = config.network.port, "Waiting for a peer - press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    let _ = command_tx.send(SessionCommand::Shutdown);
    session.await?;
    ui.await?;

    Ok(())
}
