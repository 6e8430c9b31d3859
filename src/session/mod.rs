//! Session control
//!
//! A [`SessionController`] owns this node's role: whether it is looking for
//! a peer, connected to one, streaming its microphone, or recording the
//! peer's. All transitions happen on the single thread that drives the
//! controller, in response to three event sources:
//!
//! ```text
//!   SessionCommand  (local user intent) ──┐
//!   TransportEvent  (peer + messages)   ──┼──▶ SessionController ──▶ UiEvent
//!   PipelineEvent   (stream ended)      ──┘          │
//!                                                    ▼
//!                                        Send / Receive pipelines
//! ```

mod controller;

pub use controller::SessionController;

use std::fmt;
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::pipeline::PipelineSettings;

/// Role of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport activity.
    Idle,
    /// Waiting for a peer to connect.
    Advertising,
    /// Looking for a peer to connect to.
    Browsing,
    /// Exactly one peer, nothing streaming.
    Connected,
    /// Asked the peer for its microphone; waiting for the format.
    AwaitingAudio,
    /// Streaming the local microphone to the peer.
    SendingAudio,
    /// Recording the peer's microphone.
    ReceivingAudio,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Advertising => "advertising",
            Self::Browsing => "browsing",
            Self::Connected => "connected",
            Self::AwaitingAudio => "awaiting audio",
            Self::SendingAudio => "sending audio",
            Self::ReceivingAudio => "receiving audio",
        };
        f.write_str(name)
    }
}

/// Local user intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Advertise,
    Browse,
    FinishBrowsing,
    /// Ask the connected peer to stream its microphone here.
    RequestStream,
    /// Stop recording the peer's microphone.
    StopStream,
    /// Stop streaming the local microphone.
    StopSending,
    Disconnect,
    Shutdown,
}

/// Notification for whatever presents the session to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    StateChanged(SessionState),
    /// The peer asked for our microphone.
    OpenStreamingView { requested_by: Option<String> },
    CloseStreamingView,
    RecordingFinished { path: PathBuf },
}

/// Per-node settings for a [`SessionController`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Name given to the outbound audio byte stream.
    pub stream_name: String,
    pub pipeline: PipelineSettings,
    /// Where each recording is written; overwritten every session.
    pub output_path: PathBuf,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            stream_name: config.stream.name.clone(),
            pipeline: PipelineSettings::from(&config.stream),
            output_path: config.recording.output_path(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}
