//! Recording node
//!
//! Connects to a microphone node, asks it to stream, and records the audio
//! to a WAV file until Ctrl+C or until the optional duration has elapsed.
//!
//! Usage: `receiver <host:port> [seconds]`

use anyhow::{bail, Context, Result};
use crossbeam_channel::unbounded;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peer_mic_streamer::{
    audio::{CpalCapture, WavSinkOpener},
    config::AppConfig,
    network::{tcp::TcpSettings, PeerId, TcpTransport},
    session::{SessionCommand, SessionController, SessionSettings, SessionState, UiEvent},
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

    let mut args = std::env::args().skip(1);
    let Some(target) = args.next() else {
        bail!("usage: receiver <host:port> [seconds]");
    };
    let duration = args
        .next()
        .map(|s| s.parse::<u64>().context("duration must be whole seconds"))
        .transpose()?
        .map(Duration::from_secs);

    tracing::info!(%target, "Starting recording node");

    let mut config = AppConfig::load()?;
    config.network.connect_to = Some(target);
    // Only listens after losing the peer; any free port will do.
    config.network.port = 0;

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
    command_tx.send(SessionCommand::Browse)?;

    let session = tokio::task::spawn_blocking(move || controller.run(event_rx, command_rx));

    let requests = command_tx.clone();
    let ui = tokio::task::spawn_blocking(move || {
        let mut requested = false;
        let mut saved = None;
        for event in ui_rx {
            match event {
                UiEvent::StateChanged(state) => {
                    println!("State: {}", state);
                    if state == SessionState::Connected && !requested {
                        requested = true;
                        let _ = requests.send(SessionCommand::RequestStream);
                    }
                }
                UiEvent::RecordingFinished { path } => {
                    println!("Recording saved to {}", path.display());
                    saved = Some(path);
                }
                UiEvent::OpenStreamingView { .. } | UiEvent::CloseStreamingView => {}
            }
        }
        saved
    });

    match duration {
        Some(duration) => {
            tracing::info!(seconds = duration.as_secs(), "Recording - press Ctrl+C to stop early");
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = tokio::time::sleep(duration) => {}
            }
        }
        None => {
            tracing::info!("Recording - press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    let _ = command_tx.send(SessionCommand::StopStream);
    let _ = command_tx.send(SessionCommand::Shutdown);
    session.await?;

    match ui.await? {
        Some(path) => println!("{}", path.display()),
        None => println!("Nothing was recorded"),
    }

    Ok(())
}
