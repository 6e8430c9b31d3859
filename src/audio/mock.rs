//! Scripted capture source
//!
//! [`MockCapture`] stands in for a microphone: audio is pushed by hand
//! through its [`MockCaptureHandle`] from whatever thread plays the role of
//! the audio callback.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::capture::AudioCapture;
use crate::error::CaptureError;
use crate::pipeline::CaptureProducer;
use crate::protocol::FormatDescriptor;

struct MockState {
    producer: Mutex<Option<CaptureProducer>>,
    running: AtomicBool,
    starts: Mutex<usize>,
}

/// Capture source fed from a test
pub struct MockCapture {
    format: Option<FormatDescriptor>,
    state: Arc<MockState>,
}

/// Feeds audio into a running [`MockCapture`]
#[derive(Clone)]
pub struct MockCaptureHandle {
    state: Arc<MockState>,
}

impl MockCapture {
    pub fn new(format: FormatDescriptor) -> (Self, MockCaptureHandle) {
        Self::build(Some(format))
    }

    /// A capture source with no microphone behind it.
    pub fn unavailable() -> (Self, MockCaptureHandle) {
        Self::build(None)
    }

    fn build(format: Option<FormatDescriptor>) -> (Self, MockCaptureHandle) {
        let state = Arc::new(MockState {
            producer: Mutex::new(None),
            running: AtomicBool::new(false),
            starts: Mutex::new(0),
        });
        (
            Self {
                format,
                state: state.clone(),
            },
            MockCaptureHandle { state },
        )
    }
}

impl AudioCapture for MockCapture {
    fn format(&self) -> Result<FormatDescriptor, CaptureError> {
        self.format
            .ok_or_else(|| CaptureError::Unavailable("no microphone".to_string()))
    }

    fn start(&mut self, producer: CaptureProducer) -> Result<(), CaptureError> {
        self.format()?;
        *self.state.producer.lock() = Some(producer);
        *self.state.starts.lock() += 1;
        self.state.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.producer.lock().take();
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }
}

impl MockCaptureHandle {
    /// Deliver captured bytes. Returns how many the pipeline accepted.
    pub fn push(&self, bytes: &[u8]) -> usize {
        match self.state.producer.lock().as_mut() {
            Some(producer) => producer.push(bytes),
            None => 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// How many times capture has been started.
    pub fn start_count(&self) -> usize {
        *self.state.starts.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SampleKind;

    #[test]
    fn test_unavailable_capture_refuses_format() {
        let (capture, handle) = MockCapture::unavailable();
        assert!(matches!(capture.format(), Err(CaptureError::Unavailable(_))));
        assert_eq!(handle.push(&[0; 4]), 0);
    }

    #[test]
    fn test_format_is_reported() {
        let format = FormatDescriptor::linear_pcm(44100.0, 1, 32, SampleKind::Float);
        let (capture, handle) = MockCapture::new(format);
        assert_eq!(capture.format().unwrap(), format);
        assert!(!handle.is_running());
        assert_eq!(handle.start_count(), 0);
    }
}
