//! Send pipeline: microphone capture to the outbound byte stream

use crossbeam_channel::Sender;
use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::{run_drain, Control, Direction, Drain, DrainTarget, PipelineEvent, PipelineSettings, PipelineStats, StopPolicy};
use crate::audio::buffer::{Producer, RingBuffer};
use crate::error::StreamIoError;
use crate::network::OutboundStream;
use crate::protocol::FormatDescriptor;

/// Producing end handed to the capture callback.
///
/// `push` never blocks or allocates. When the ring is full the newest audio
/// is dropped, in whole frames, so the stream stays frame-aligned.
pub struct CaptureProducer {
    producer: Producer,
    frame_bytes: usize,
    control: Arc<Control>,
}

impl CaptureProducer {
    /// Offer a chunk of captured PCM. Returns the number of bytes accepted.
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        if !self.control.is_active() {
            return 0;
        }

        let room = self.producer.available_to_write();
        let accept = if bytes.len() <= room {
            bytes.len()
        } else {
            room - room % self.frame_bytes
        };

        let accepted = self.producer.produce(&bytes[..accept]);
        self.control.record_produced(accepted);
        if accepted < bytes.len() {
            self.control.record_dropped(bytes.len() - accepted);
        }
        accepted
    }

    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    /// Size of one interleaved frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }
}

struct StreamTarget {
    stream: Option<OutboundStream>,
}

impl DrainTarget for StreamTarget {
    fn write(&mut self, bytes: &[u8]) -> Result<(), StreamIoError> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(bytes).map_err(StreamIoError::Write),
            None => Err(StreamIoError::EndOfStream),
        }
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.flush() {
                tracing::debug!(error = %e, "Flush on outbound stream close failed");
            }
        }
    }
}

/// Capture → ring → outbound stream
pub struct SendPipeline {
    control: Arc<Control>,
    drain_handle: Option<JoinHandle<()>>,
}

impl SendPipeline {
    /// Allocate the ring and start the drain thread.
    ///
    /// Returns the pipeline and the producer the capture source must feed.
    pub fn start(
        outbound: OutboundStream,
        format: &FormatDescriptor,
        settings: &PipelineSettings,
        events: Sender<PipelineEvent>,
    ) -> Result<(Self, CaptureProducer), StreamIoError> {
        let frame_bytes = format.frame_alignment();
        let capacity = settings.capacity_for(frame_bytes)?;
        if capacity > settings.capacity {
            tracing::debug!(
                configured = settings.capacity,
                capacity,
                frame_bytes,
                "Send ring grown to hold whole frames"
            );
        }
        let control = Control::new();
        let (producer, consumer) = RingBuffer::new(capacity);

        // Whole frames per write, so a chunk dropped downstream never splits one.
        let drain = Drain::new(
            consumer,
            StreamTarget {
                stream: Some(outbound),
            },
            settings.max_chunk,
            frame_bytes,
        );

        let thread_control = control.clone();
        let idle = settings.drain_interval;
        let drain_handle = thread::Builder::new()
            .name(format!("send-drain-{}", control.id()))
            .spawn(move || {
                run_drain(drain, thread_control, Direction::Send, StopPolicy::Discard, idle, events)
            })
            .map_err(StreamIoError::Spawn)?;

        tracing::info!(
            pipeline = control.id(),
            capacity,
            sample_rate = format.sample_rate,
            channels = format.channels_per_frame,
            "Send pipeline started"
        );

        let producer = CaptureProducer {
            producer,
            frame_bytes,
            control: control.clone(),
        };

        Ok((
            Self {
                control,
                drain_handle: Some(drain_handle),
            },
            producer,
        ))
    }

    pub fn id(&self) -> u64 {
        self.control.id()
    }

    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    pub fn stats(&self) -> PipelineStats {
        self.control.stats()
    }

    /// Stop draining and close the outbound stream. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let was_active = self.control.deactivate();

        if let Some(handle) = self.drain_handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!(pipeline = self.id(), "Send drain thread panicked");
            }
            let stats = self.stats();
            tracing::info!(
                pipeline = self.id(),
                sent = stats.bytes_consumed,
                dropped = stats.bytes_dropped,
                "Send pipeline stopped"
            );
        } else if was_active {
            tracing::debug!(pipeline = self.id(), "Send pipeline deactivated");
        }
    }
}

impl Drop for SendPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
