//! # Peer Mic Streamer
//!
//! Stream a live microphone from one device to another over a peer
//! connection and record it to a file on the receiving side.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────┐              ┌──────────────────────────────────┐
//! │        MICROPHONE NODE           │              │          RECORDING NODE          │
//! │                                  │  startStreamingAudio {peer}                     │
//! │  ┌────────────────────────────┐  │◀─────────────┤  ┌────────────────────────────┐  │
//! │  │ SessionController          │  │              │  │ SessionController          │  │
//! │  │ (session)                  │  │  startCapturingAudioStream {format}           │  │
//! │  └──────────────┬─────────────┘  ├─────────────▶│  └──────────────┬─────────────┘  │
//! │                 │                │              │                 │                │
//! │  ┌──────────────▼─────────────┐  │              │  ┌──────────────▼─────────────┐  │
//! │  │ Capture callback (cpal)    │  │              │  │ Stream reader thread       │  │
//! │  │   │ produce                │  │  raw PCM     │  │   │ produce                │  │
//! │  │   ▼                        │  │  byte stream │  │   ▼                        │  │
//! │  │ RingBuffer (audio::buffer) │  │              │  │ RingBuffer (audio::buffer) │  │
//! │  │   │ drain thread           │  │              │  │   │ drain thread           │  │
//! │  │   ▼                        │  │              │  │   ▼                        │  │
//! │  │ Outbound stream ───────────┼──┼─────────────▶│──┼─▶ WAV sink (hound)         │  │
//! │  └────────────────────────────┘  │              │  └────────────────────────────┘  │
//! │       SendPipeline (pipeline)    │              │     ReceivePipeline (pipeline)   │
//! └──────────────────────────────────┘              └──────────────────────────────────┘
//!                     ▲                                               ▲
//!                     └──────────── Transport (network) ──────────────┘
//!                          messages + byte streams over TCP
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Largest single read from or write to a byte stream
    pub const MAX_READ_SIZE: usize = 2048;

    /// Ring buffer capacity as a multiple of [`MAX_READ_SIZE`]
    pub const CAPACITY_MULTIPLIER: usize = 4;

    /// Ring buffer capacity in bytes
    pub const RING_BUFFER_CAPACITY: usize = MAX_READ_SIZE * CAPACITY_MULTIPLIER;

    /// Fewest whole frames a pipeline ring holds, whatever its configured size
    pub const MIN_RING_FRAMES: usize = 4;

    /// Largest frame a pipeline will buffer
    pub const MAX_FRAME_BYTES: usize = 1 << 20;

    /// Idle sleep of a pipeline drain thread
    pub const DRAIN_INTERVAL_MS: u64 = 5;

    /// Chunks an in-process byte stream queues before dropping new ones
    pub const STREAM_QUEUE_CHUNKS: usize = 64;

    /// How long a stream reader waits for data before checking for a stop
    pub const STREAM_READ_POLL_MS: u64 = 20;

    /// Name of the microphone byte stream
    pub const DEFAULT_STREAM_NAME: &str = "spare mic stream";

    /// File stem of the recording
    pub const OUTPUT_FILE_NAME: &str = "audioOutput";

    /// Default TCP port for peer connections
    pub const DEFAULT_PORT: u16 = 5000;
}
