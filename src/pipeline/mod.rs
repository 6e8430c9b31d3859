//! Stream pipelines
//!
//! A pipeline moves raw PCM from a source, through a [`RingBuffer`], to a
//! sink. Two configurations exist:
//!
//! ```text
//! send:     capture callback ──produce──▶ ring ──drain thread──▶ outbound byte stream
//! receive:  inbound byte stream ──reader thread──▶ ring ──drain thread──▶ file sink
//! ```
//!
//! Each side of the ring is owned by exactly one context. A shared `active`
//! flag is checked by both sides so a stop is observed promptly; the ring's
//! storage is released once both handles have been dropped.
//!
//! [`RingBuffer`]: crate::audio::buffer::RingBuffer

mod receive;
mod send;

pub use receive::ReceivePipeline;
pub use send::{CaptureProducer, SendPipeline};

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::buffer::Consumer;
use crate::config::StreamConfig;
use crate::constants::{
    DRAIN_INTERVAL_MS, MAX_FRAME_BYTES, MAX_READ_SIZE, MIN_RING_FRAMES, RING_BUFFER_CAPACITY,
};
use crate::error::StreamIoError;

/// Which way audio flows through a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Why a pipeline stopped on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    EndOfStream,
    Failed(String),
}

/// Notification from a pipeline thread to the control context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Ended {
        direction: Direction,
        pipeline: u64,
        reason: EndReason,
    },
}

/// Sizing and pacing for a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Ring buffer capacity in bytes.
    pub capacity: usize,
    /// Largest single read or write.
    pub max_chunk: usize,
    /// How long an idle drain thread sleeps before polling again.
    pub drain_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capacity: RING_BUFFER_CAPACITY,
            max_chunk: MAX_READ_SIZE,
            drain_interval: Duration::from_millis(DRAIN_INTERVAL_MS),
        }
    }
}

impl PipelineSettings {
    /// Ring capacity for a stream of `frame_bytes`-sized frames.
    ///
    /// The configured capacity is grown when it cannot hold
    /// [`MIN_RING_FRAMES`] whole frames, otherwise a frame-aligned drain
    /// could never see a complete frame.
    pub fn capacity_for(&self, frame_bytes: usize) -> Result<usize, StreamIoError> {
        if frame_bytes > MAX_FRAME_BYTES {
            return Err(StreamIoError::FrameTooLarge(frame_bytes));
        }
        Ok(self.capacity.max(frame_bytes.max(1) * MIN_RING_FRAMES))
    }
}

impl From<&StreamConfig> for PipelineSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            capacity: config.ring_capacity(),
            max_chunk: config.max_read_size.max(1),
            drain_interval: Duration::from_millis(config.drain_interval_ms),
        }
    }
}

/// Byte counters for one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub bytes_produced: u64,
    pub bytes_consumed: u64,
    pub bytes_dropped: u64,
}

/// State shared by the owner and every thread of one pipeline.
#[derive(Debug)]
pub(crate) struct Control {
    id: u64,
    active: AtomicBool,
    /// Set once the producing side will never produce again.
    source_done: AtomicBool,
    produced: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
}

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

impl Control {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            source_done: AtomicBool::new(false),
            produced: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Clear the active flag, returning whether it was set.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn finish_source(&self) {
        self.source_done.store(true, Ordering::Release);
    }

    pub(crate) fn is_source_done(&self) -> bool {
        self.source_done.load(Ordering::Acquire)
    }

    pub(crate) fn record_produced(&self, bytes: usize) {
        self.produced.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, bytes: usize) {
        self.dropped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_consumed(&self, bytes: usize) {
        self.consumed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> PipelineStats {
        PipelineStats {
            bytes_produced: self.produced.load(Ordering::Relaxed),
            bytes_consumed: self.consumed.load(Ordering::Relaxed),
            bytes_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Destination a drain thread forwards ring contents to.
pub(crate) trait DrainTarget: Send {
    fn write(&mut self, bytes: &[u8]) -> Result<(), StreamIoError>;
    fn close(&mut self);
}

/// What the drain thread does with bytes still buffered when it stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopPolicy {
    /// Stop as soon as the pipeline is deactivated; pending bytes are dropped.
    Discard,
    /// Keep draining until the source is finished and the ring is empty.
    Flush,
}

/// Consumer side of a pipeline: pulls from the ring, pushes to a target.
pub(crate) struct Drain<T> {
    consumer: Consumer,
    target: T,
    scratch: Vec<u8>,
    alignment: usize,
}

impl<T: DrainTarget> Drain<T> {
    /// `alignment` is the granularity bytes are forwarded in (one audio
    /// frame for file sinks, one byte for network streams).
    pub(crate) fn new(consumer: Consumer, target: T, max_chunk: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let chunk = (max_chunk / alignment).max(1) * alignment;
        Self {
            consumer,
            target,
            scratch: vec![0u8; chunk],
            alignment,
        }
    }

    /// Forward one chunk of pending bytes. Returns how many were forwarded.
    pub(crate) fn drain_once(&mut self) -> Result<usize, StreamIoError> {
        let pending = self.consumer.available_to_read().min(self.scratch.len());
        let take = pending - pending % self.alignment;
        if take == 0 {
            return Ok(0);
        }

        let count = self.consumer.consume_into(&mut self.scratch[..take]);
        self.target.write(&self.scratch[..count])?;
        Ok(count)
    }

    pub(crate) fn pending(&self) -> usize {
        self.consumer.available_to_read()
    }

    pub(crate) fn close(&mut self) {
        self.target.close();
    }
}

/// Body of a drain thread.
pub(crate) fn run_drain<T: DrainTarget>(
    mut drain: Drain<T>,
    control: Arc<Control>,
    direction: Direction,
    policy: StopPolicy,
    idle: Duration,
    events: Sender<PipelineEvent>,
) {
    let mut reported_drops = 0u64;

    loop {
        let finishing = match policy {
            StopPolicy::Discard => !control.is_active(),
            StopPolicy::Flush => control.is_source_done(),
        };
        if finishing && policy == StopPolicy::Discard {
            break;
        }

        match drain.drain_once() {
            Ok(0) if finishing => break,
            Ok(0) => thread::park_timeout(idle),
            Ok(count) => control.record_consumed(count),
            Err(e) => {
                tracing::error!(pipeline = control.id(), ?direction, error = %e, "Drain failed");
                control.deactivate();
                let _ = events.send(PipelineEvent::Ended {
                    direction,
                    pipeline: control.id(),
                    reason: EndReason::Failed(e.to_string()),
                });
                break;
            }
        }

        let dropped = control.stats().bytes_dropped;
        if dropped > reported_drops {
            tracing::trace!(
                pipeline = control.id(),
                total_dropped = dropped,
                "Ring buffer full, captured audio dropped"
            );
            reported_drops = dropped;
        }
    }

    let leftover = drain.pending();
    if leftover > 0 {
        tracing::debug!(pipeline = control.id(), bytes = leftover, "Discarding undrained bytes");
    }
    drain.close();
    tracing::debug!(pipeline = control.id(), ?direction, "Drain thread exiting");
}
