//! Receive pipeline: inbound byte stream to the recording sink

use crossbeam_channel::Sender;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{
    run_drain, Control, Direction, Drain, DrainTarget, EndReason, PipelineEvent, PipelineSettings,
    PipelineStats, StopPolicy,
};
use crate::audio::buffer::{Producer, RingBuffer};
use crate::audio::sink::AudioSink;
use crate::error::StreamIoError;
use crate::network::InboundStream;
use crate::protocol::FormatDescriptor;

struct SinkTarget {
    sink: Box<dyn AudioSink>,
}

impl DrainTarget for SinkTarget {
    fn write(&mut self, bytes: &[u8]) -> Result<(), StreamIoError> {
        Ok(self.sink.append(bytes)?)
    }

    fn close(&mut self) {
        if let Err(e) = self.sink.close() {
            tracing::error!(error = %e, "Failed to close recording sink");
        }
    }
}

enum ReadOutcome {
    Data(usize),
    /// Nothing arrived before the stream's read timeout.
    Idle,
    /// No room in the ring; the bytes stay queued in the inbound stream.
    Full,
    End,
}

/// Producer side of the receive ring, driven by the transport I/O context.
struct StreamReader {
    inbound: InboundStream,
    producer: Producer,
    scratch: Vec<u8>,
}

impl StreamReader {
    fn read_once(&mut self) -> Result<ReadOutcome, StreamIoError> {
        let room = self.producer.available_to_write().min(self.scratch.len());
        if room == 0 {
            return Ok(ReadOutcome::Full);
        }

        match self.inbound.read(&mut self.scratch[..room]) {
            Ok(0) => Ok(ReadOutcome::End),
            Ok(count) => {
                // Sole producer and `count <= room`, so everything fits.
                let accepted = self.producer.produce(&self.scratch[..count]);
                Ok(ReadOutcome::Data(accepted))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::Idle)
            }
            Err(e) => Err(StreamIoError::Read(e)),
        }
    }
}

fn run_reader(
    mut reader: StreamReader,
    control: Arc<Control>,
    idle: Duration,
    events: Sender<PipelineEvent>,
) {
    let reason = loop {
        if !control.is_active() {
            break None;
        }

        match reader.read_once() {
            Ok(ReadOutcome::Data(count)) => control.record_produced(count),
            Ok(ReadOutcome::Idle) | Ok(ReadOutcome::Full) => thread::sleep(idle),
            Ok(ReadOutcome::End) => {
                tracing::info!(pipeline = control.id(), "Inbound stream ended");
                break Some(EndReason::EndOfStream);
            }
            Err(e) => {
                tracing::error!(pipeline = control.id(), error = %e, "Inbound stream failed");
                break Some(EndReason::Failed(e.to_string()));
            }
        }
    };

    if let Some(reason) = reason {
        let _ = events.send(PipelineEvent::Ended {
            direction: Direction::Receive,
            pipeline: control.id(),
            reason,
        });
    }
}

/// Inbound stream → ring → sink
///
/// The sink is opened before the inbound stream is known, because the
/// stream and the format announcement travel separately and may arrive in
/// either order. [`attach`](ReceivePipeline::attach) supplies the stream.
pub struct ReceivePipeline {
    control: Arc<Control>,
    format: FormatDescriptor,
    settings: PipelineSettings,
    events: Sender<PipelineEvent>,
    producer: Option<Producer>,
    reader_handle: Option<JoinHandle<()>>,
    drain_handle: Option<JoinHandle<()>>,
}

impl ReceivePipeline {
    /// Allocate the ring and start draining into `sink`.
    pub fn start(
        sink: Box<dyn AudioSink>,
        format: FormatDescriptor,
        settings: &PipelineSettings,
        events: Sender<PipelineEvent>,
    ) -> Result<Self, StreamIoError> {
        let capacity = settings.capacity_for(format.frame_alignment())?;
        if capacity > settings.capacity {
            tracing::debug!(
                configured = settings.capacity,
                capacity,
                frame_bytes = format.frame_alignment(),
                "Receive ring grown to hold whole frames"
            );
        }
        let control = Control::new();
        let (producer, consumer) = RingBuffer::new(capacity);

        let drain = Drain::new(
            consumer,
            SinkTarget { sink },
            settings.max_chunk,
            format.frame_alignment(),
        );

        let thread_control = control.clone();
        let thread_events = events.clone();
        let idle = settings.drain_interval;
        let drain_handle = thread::Builder::new()
            .name(format!("receive-drain-{}", control.id()))
            .spawn(move || {
                run_drain(
                    drain,
                    thread_control,
                    Direction::Receive,
                    StopPolicy::Flush,
                    idle,
                    thread_events,
                )
            })
            .map_err(StreamIoError::Spawn)?;

        tracing::info!(
            pipeline = control.id(),
            capacity,
            sample_rate = format.sample_rate,
            channels = format.channels_per_frame,
            bits = format.bits_per_channel,
            "Receive pipeline started"
        );

        Ok(Self {
            control,
            format,
            settings: settings.clone(),
            events,
            producer: Some(producer),
            reader_handle: None,
            drain_handle: Some(drain_handle),
        })
    }

    /// Start reading from the peer's byte stream.
    pub fn attach(&mut self, inbound: InboundStream) -> Result<(), StreamIoError> {
        let producer = self.producer.take().ok_or(StreamIoError::AlreadyAttached)?;

        let reader = StreamReader {
            inbound,
            producer,
            scratch: vec![0u8; self.settings.max_chunk],
        };

        let control = self.control.clone();
        let events = self.events.clone();
        let idle = self.settings.drain_interval;
        let handle = thread::Builder::new()
            .name(format!("receive-reader-{}", self.control.id()))
            .spawn(move || run_reader(reader, control, idle, events))
            .map_err(StreamIoError::Spawn)?;

        self.reader_handle = Some(handle);
        tracing::debug!(pipeline = self.id(), "Inbound stream attached");
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.producer.is_none()
    }

    pub fn id(&self) -> u64 {
        self.control.id()
    }

    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub fn stats(&self) -> PipelineStats {
        self.control.stats()
    }

    /// Stop reading, flush what is buffered to the sink, and close it.
    /// Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.control.deactivate();

        if let Some(handle) = self.reader_handle.take() {
            if handle.join().is_err() {
                tracing::error!(pipeline = self.id(), "Receive reader thread panicked");
            }
        }
        self.producer = None;
        self.control.finish_source();

        if let Some(handle) = self.drain_handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!(pipeline = self.id(), "Receive drain thread panicked");
            }
            let stats = self.stats();
            tracing::info!(
                pipeline = self.id(),
                received = stats.bytes_produced,
                recorded = stats.bytes_consumed,
                "Receive pipeline stopped"
            );
        }
    }
}

impl Drop for ReceivePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::MemorySink;
    use crate::network::stream::byte_stream_pair;
    use crate::protocol::SampleKind;
    use crossbeam_channel::unbounded;
    use std::io::Write;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            capacity: 32,
            max_chunk: 8,
            drain_interval: Duration::from_millis(1),
        }
    }

    fn mono_i16() -> FormatDescriptor {
        FormatDescriptor::linear_pcm(16000.0, 1, 16, SampleKind::SignedInteger)
    }

    #[test]
    fn test_stream_bytes_are_recorded_and_flushed() {
        let (sink, recording) = MemorySink::new();
        let (events, _rx) = unbounded();
        let mut pipeline = ReceivePipeline::start(Box::new(sink), mono_i16(), &settings(), events).unwrap();

        let (mut writer, reader) = byte_stream_pair(Duration::from_millis(5));
        pipeline.attach(Box::new(reader)).unwrap();
        assert!(pipeline.is_attached());

        let expected: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        writer.write_all(&expected).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pipeline.stats().bytes_produced < expected.len() as u64 {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        pipeline.stop();
        assert_eq!(recording.bytes(), expected);
        assert!(recording.is_closed());
    }

    #[test]
    fn test_end_of_stream_is_reported() {
        let (sink, _recording) = MemorySink::new();
        let (events, rx) = unbounded();
        let mut pipeline = ReceivePipeline::start(Box::new(sink), mono_i16(), &settings(), events).unwrap();

        let (writer, reader) = byte_stream_pair(Duration::from_millis(5));
        pipeline.attach(Box::new(reader)).unwrap();
        drop(writer);

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            PipelineEvent::Ended {
                direction: Direction::Receive,
                pipeline: pipeline.id(),
                reason: EndReason::EndOfStream,
            }
        );
        pipeline.stop();
    }

    #[test]
    fn test_second_attach_is_rejected() {
        let (sink, _recording) = MemorySink::new();
        let (events, _rx) = unbounded();
        let mut pipeline = ReceivePipeline::start(Box::new(sink), mono_i16(), &settings(), events).unwrap();

        let (_w1, r1) = byte_stream_pair(Duration::from_millis(5));
        let (_w2, r2) = byte_stream_pair(Duration::from_millis(5));
        pipeline.attach(Box::new(r1)).unwrap();
        assert!(matches!(pipeline.attach(Box::new(r2)), Err(StreamIoError::AlreadyAttached)));
        pipeline.stop();
    }

    #[test]
    fn test_stop_without_stream_closes_sink() {
        let (sink, recording) = MemorySink::new();
        let (events, _rx) = unbounded();
        let mut pipeline = ReceivePipeline::start(Box::new(sink), mono_i16(), &settings(), events).unwrap();

        pipeline.stop();
        pipeline.stop();
        assert!(recording.is_closed());
        assert!(recording.bytes().is_empty());
    }

    #[test]
    fn test_frames_larger_than_configured_ring_are_recorded() {
        // 16 channels of 32-bit float: one frame is twice the configured ring.
        let format = FormatDescriptor::linear_pcm(48000.0, 16, 32, SampleKind::Float);
        assert_eq!(format.frame_alignment(), 64);

        let (sink, recording) = MemorySink::new();
        let (events, rx) = unbounded();
        let mut pipeline = ReceivePipeline::start(Box::new(sink), format, &settings(), events).unwrap();

        let (mut writer, reader) = byte_stream_pair(Duration::from_millis(5));
        pipeline.attach(Box::new(reader)).unwrap();

        let expected: Vec<u8> = (0..640u32).map(|i| (i % 251) as u8).collect();
        writer.write_all(&expected).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pipeline.stats().bytes_produced < expected.len() as u64 {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        pipeline.stop();
        assert!(rx.try_recv().is_err());
        assert_eq!(recording.bytes(), expected);
    }

    #[test]
    fn test_partial_frame_is_not_recorded() {
        let (sink, recording) = MemorySink::new();
        let (events, _rx) = unbounded();
        let mut pipeline = ReceivePipeline::start(Box::new(sink), mono_i16(), &settings(), events).unwrap();

        let (mut writer, reader) = byte_stream_pair(Duration::from_millis(5));
        pipeline.attach(Box::new(reader)).unwrap();
        writer.write_all(&[1, 2, 3]).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pipeline.stats().bytes_produced < 3 {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        pipeline.stop();
        assert_eq!(recording.bytes(), vec![1, 2]);
    }
}
