//! In-memory sinks for tests and demos

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{AudioSink, SinkOpener};
use crate::error::SinkError;
use crate::protocol::FormatDescriptor;

#[derive(Default)]
struct RecordingState {
    bytes: Vec<u8>,
    closed: bool,
}

/// Observer handle onto what a [`MemorySink`] has received
#[derive(Clone, Default)]
pub struct Recording {
    state: Arc<Mutex<RecordingState>>,
}

impl Recording {
    pub fn bytes(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Sink that keeps everything in a shared buffer
pub struct MemorySink {
    recording: Recording,
}

impl MemorySink {
    pub fn new() -> (Self, Recording) {
        let recording = Recording::default();
        (
            Self {
                recording: recording.clone(),
            },
            recording,
        )
    }
}

impl AudioSink for MemorySink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let mut state = self.recording.state.lock();
        if state.closed {
            return Err(SinkError::Closed);
        }
        state.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.recording.state.lock().closed = true;
        Ok(())
    }
}

/// One sink handed out by a [`MemorySinkOpener`]
#[derive(Clone)]
pub struct OpenedSink {
    pub path: PathBuf,
    pub format: FormatDescriptor,
    pub recording: Recording,
}

/// Everything a [`MemorySinkOpener`] has opened, in order
#[derive(Clone, Default)]
pub struct SinkLog {
    opened: Arc<Mutex<Vec<OpenedSink>>>,
}

impl SinkLog {
    pub fn opened(&self) -> Vec<OpenedSink> {
        self.opened.lock().clone()
    }

    pub fn last(&self) -> Option<OpenedSink> {
        self.opened.lock().last().cloned()
    }
}

/// Opener producing [`MemorySink`]s
pub struct MemorySinkOpener {
    log: SinkLog,
    reject: bool,
}

impl MemorySinkOpener {
    pub fn new() -> (Self, SinkLog) {
        let log = SinkLog::default();
        (
            Self {
                log: log.clone(),
                reject: false,
            },
            log,
        )
    }

    /// An opener that refuses every format.
    pub fn rejecting() -> Self {
        Self {
            log: SinkLog::default(),
            reject: true,
        }
    }
}

impl SinkOpener for MemorySinkOpener {
    fn open(&mut self, path: &Path, format: &FormatDescriptor) -> Result<Box<dyn AudioSink>, SinkError> {
        if self.reject {
            return Err(SinkError::UnsupportedFormat(format!(
                "{} at {} Hz",
                format.format_id_code(),
                format.sample_rate
            )));
        }

        let (sink, recording) = MemorySink::new();
        self.log.opened.lock().push(OpenedSink {
            path: path.to_path_buf(),
            format: *format,
            recording,
        });
        Ok(Box::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SampleKind;

    #[test]
    fn test_closed_sink_rejects_appends() {
        let (mut sink, recording) = MemorySink::new();
        sink.append(&[1, 2]).unwrap();
        sink.close().unwrap();
        assert!(matches!(sink.append(&[3]), Err(SinkError::Closed)));
        assert_eq!(recording.bytes(), vec![1, 2]);
        assert!(recording.is_closed());
    }

    #[test]
    fn test_opener_logs_sessions() {
        let (mut opener, log) = MemorySinkOpener::new();
        let format = FormatDescriptor::linear_pcm(8000.0, 1, 8, SampleKind::SignedInteger);

        let mut first = opener.open(Path::new("/tmp/a.wav"), &format).unwrap();
        first.append(&[9]).unwrap();
        opener.open(Path::new("/tmp/b.wav"), &format).unwrap();

        let opened = log.opened();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[0].recording.bytes(), vec![9]);
        assert_eq!(log.last().unwrap().path, PathBuf::from("/tmp/b.wav"));
    }
}
