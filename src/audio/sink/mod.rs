//! Recording sinks
//!
//! The receive pipeline writes raw PCM into an [`AudioSink`]. Sinks are
//! created per session by a [`SinkOpener`] once the sender's format is known.

mod memory;
mod wav;

pub use memory::{MemorySink, MemorySinkOpener, OpenedSink, Recording, SinkLog};
pub use wav::{WavSink, WavSinkOpener};

use std::path::Path;

use crate::error::SinkError;
use crate::protocol::FormatDescriptor;

/// Destination for received audio bytes
pub trait AudioSink: Send {
    /// Append raw PCM in the format the sink was opened with.
    fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError>;

    /// Finish the recording. Further appends fail; closing again is a no-op.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Creates a sink for each receive session
pub trait SinkOpener: Send {
    fn open(&mut self, path: &Path, format: &FormatDescriptor) -> Result<Box<dyn AudioSink>, SinkError>;
}
