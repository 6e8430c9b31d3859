//! Control-plane actions exchanged between peers
//!
//! On the wire an action is a JSON object:
//!
//! ```text
//! { "actionToTake": "startCapturingAudioStream",
//!   "time": "2024-01-01T00:00:00Z",        (optional)
//!   "data": "<base64 format descriptor>",   (startCapturingAudioStream only)
//!   "peer": "Living Room iPad" }            (startStreamingAudio only)
//! ```
//!
//! Absent optional fields are omitted rather than written as `null` or `""`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::protocol::format::FormatDescriptor;

/// Command tag carried in `actionToTake`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    StartStreamingAudio,
    StopStreamingAudio,
    StartCapturingAudioStream,
    StopCapturingAudioStream,
}

/// Command plus exactly the fields that command uses.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask the remote peer to start streaming its microphone to us.
    StartStreamingAudio { peer: Option<String> },
    /// Ask the remote peer to stop streaming.
    StopStreamingAudio,
    /// Announces the format of the byte stream that is about to arrive.
    StartCapturingAudioStream { format: FormatDescriptor },
    /// The streaming peer has stopped; close the recording.
    StopCapturingAudioStream,
}

impl Command {
    pub fn action_type(&self) -> ActionType {
        match self {
            Command::StartStreamingAudio { .. } => ActionType::StartStreamingAudio,
            Command::StopStreamingAudio => ActionType::StopStreamingAudio,
            Command::StartCapturingAudioStream { .. } => ActionType::StartCapturingAudioStream,
            Command::StopCapturingAudioStream => ActionType::StopCapturingAudioStream,
        }
    }
}

/// A control message. Built when sent, decoded when received, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub command: Command,
    /// Free-form timestamp; carried but not interpreted.
    pub time: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAction {
    action_to_take: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peer: Option<String>,
}

impl Action {
    pub fn new(command: Command) -> Self {
        Self { command, time: None }
    }

    pub fn start_streaming(peer: Option<String>) -> Self {
        Self::new(Command::StartStreamingAudio { peer })
    }

    pub fn stop_streaming() -> Self {
        Self::new(Command::StopStreamingAudio)
    }

    pub fn start_capturing(format: FormatDescriptor) -> Self {
        Self::new(Command::StartCapturingAudioStream { format })
    }

    pub fn stop_capturing() -> Self {
        Self::new(Command::StopCapturingAudioStream)
    }

    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    /// Stamp with the current UTC time in RFC 3339 form.
    pub fn stamped(self) -> Self {
        self.with_time(chrono::Utc::now().to_rfc3339())
    }

    pub fn action_type(&self) -> ActionType {
        self.command.action_type()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let (data, peer) = match &self.command {
            Command::StartStreamingAudio { peer } => (None, peer.clone()),
            Command::StartCapturingAudioStream { format } => {
                (Some(BASE64.encode(format.encode()?)), None)
            }
            Command::StopStreamingAudio | Command::StopCapturingAudioStream => (None, None),
        };

        let wire = WireAction {
            action_to_take: self.action_type(),
            time: self.time.clone(),
            data,
            peer,
        };

        Ok(serde_json::to_vec(&wire)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let wire: WireAction = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::malformed(format!("action: {e}")))?;

        if wire.data.is_some() && wire.action_to_take != ActionType::StartCapturingAudioStream {
            return Err(DecodeError::malformed(format!(
                "{:?} must not carry a payload",
                wire.action_to_take
            )));
        }

        if wire.peer.is_some() && wire.action_to_take != ActionType::StartStreamingAudio {
            tracing::debug!(action = ?wire.action_to_take, "ignoring peer field");
        }

        let command = match wire.action_to_take {
            ActionType::StartStreamingAudio => Command::StartStreamingAudio { peer: wire.peer },
            ActionType::StopStreamingAudio => Command::StopStreamingAudio,
            ActionType::StartCapturingAudioStream => {
                let data = wire.data.ok_or_else(|| {
                    DecodeError::malformed("startCapturingAudioStream without payload")
                })?;
                let raw = BASE64
                    .decode(data)
                    .map_err(|e| DecodeError::malformed(format!("payload encoding: {e}")))?;
                Command::StartCapturingAudioStream {
                    format: FormatDescriptor::decode(&raw)?,
                }
            }
            ActionType::StopCapturingAudioStream => Command::StopCapturingAudioStream,
        };

        Ok(Self {
            command,
            time: wire.time,
        })
    }
}
