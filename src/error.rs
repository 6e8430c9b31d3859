//! Error types for the peer microphone streamer

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Stream I/O error: {0}")]
    StreamIo(#[from] StreamIoError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-plane decoding errors.
///
/// Always recovered locally by dropping the offending message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed input: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

/// Control-plane encoding errors
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Format descriptor encoding failed: {0}")]
    Format(#[from] bincode::Error),

    #[error("Action encoding failed: {0}")]
    Action(#[from] serde_json::Error),
}

/// Peer transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No peer connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Failed to open byte stream: {0}")]
    StreamOpenFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Transport IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network byte-stream errors
#[derive(Error, Debug)]
pub enum StreamIoError {
    #[error("End of stream")]
    EndOfStream,

    #[error("Stream read failed: {0}")]
    Read(std::io::Error),

    #[error("Stream write failed: {0}")]
    Write(std::io::Error),

    #[error("Inbound stream already attached")]
    AlreadyAttached,

    #[error("Frame of {0} bytes is too large to buffer")]
    FrameTooLarge(usize),

    #[error("Failed to spawn pipeline thread: {0}")]
    Spawn(std::io::Error),

    #[error("Sink rejected data: {0}")]
    Sink(#[from] SinkError),
}

/// Audio capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported capture format: {0}")]
    UnsupportedFormat(String),

    #[error("Capture stream error: {0}")]
    Stream(String),
}

/// Recording sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Unsupported sink format: {0}")]
    UnsupportedFormat(String),

    #[error("Sink is closed")]
    Closed,

    #[error("Sink IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
