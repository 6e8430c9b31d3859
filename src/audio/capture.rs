//! Microphone capture
//!
//! A capture source hands raw interleaved PCM to the send pipeline's
//! [`CaptureProducer`] from the audio subsystem's own real-time thread.
//! The callback converts samples into a scratch buffer allocated up front and
//! never blocks.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SizedSample, SupportedStreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::find_input_device;
use crate::error::CaptureError;
use crate::pipeline::CaptureProducer;
use crate::protocol::{FormatDescriptor, SampleKind};

/// Frames converted per push from the capture callback
const SCRATCH_FRAMES: usize = 1024;
const START_TIMEOUT: Duration = Duration::from_secs(3);

/// Source of live microphone audio
pub trait AudioCapture: Send {
    /// Format of the audio [`start`](AudioCapture::start) will deliver.
    fn format(&self) -> Result<FormatDescriptor, CaptureError>;

    /// Begin delivering audio into `producer`.
    fn start(&mut self, producer: CaptureProducer) -> Result<(), CaptureError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Sample types the capture callback can forward as raw bytes
trait PcmSample: SizedSample + Send + 'static {
    const WIDTH: usize;
    fn write_ne(self, out: &mut [u8]);
}

impl PcmSample for f32 {
    const WIDTH: usize = 4;
    fn write_ne(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_ne_bytes());
    }
}

impl PcmSample for i16 {
    const WIDTH: usize = 2;
    fn write_ne(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_ne_bytes());
    }
}

fn descriptor_for(config: &SupportedStreamConfig) -> Result<FormatDescriptor, CaptureError> {
    let (bits, kind) = match config.sample_format() {
        SampleFormat::F32 => (32, SampleKind::Float),
        SampleFormat::I16 => (16, SampleKind::SignedInteger),
        other => {
            return Err(CaptureError::UnsupportedFormat(format!("{:?} samples", other)));
        }
    };
    Ok(FormatDescriptor::linear_pcm(
        config.sample_rate().0 as f64,
        config.channels() as u32,
        bits,
        kind,
    ))
}

fn build_stream<T: PcmSample>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: CaptureProducer,
    errors: Sender<CaptureError>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let frame_bytes = producer.frame_bytes().max(T::WIDTH);
    let mut scratch = vec![0u8; SCRATCH_FRAMES * frame_bytes];
    let samples_per_push = scratch.len() / T::WIDTH;

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for chunk in data.chunks(samples_per_push) {
                let len = chunk.len() * T::WIDTH;
                for (&sample, out) in chunk.iter().zip(scratch[..len].chunks_exact_mut(T::WIDTH)) {
                    sample.write_ne(out);
                }
                producer.push(&scratch[..len]);
            }
        },
        move |err| {
            let _ = errors.try_send(CaptureError::Stream(err.to_string()));
        },
        None,
    )
}

/// Microphone capture through `cpal`
pub struct CpalCapture {
    device_name: Option<String>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<CaptureError>>,
}

impl CpalCapture {
    /// Capture from the named input device, or the default one.
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
        }
    }

    fn device_config(&self) -> Result<(cpal::Device, SupportedStreamConfig), CaptureError> {
        let device = find_input_device(self.device_name.as_deref())?;
        let config = device
            .default_input_config()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        Ok((device, config))
    }

    /// Next error reported by the audio stream, if any.
    pub fn check_errors(&self) -> Option<CaptureError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl AudioCapture for CpalCapture {
    fn format(&self) -> Result<FormatDescriptor, CaptureError> {
        let (_, config) = self.device_config()?;
        descriptor_for(&config)
    }

    fn start(&mut self, producer: CaptureProducer) -> Result<(), CaptureError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (device, supported) = self.device_config()?;
        let sample_format = supported.sample_format();
        let config = supported.config();

        let (error_tx, error_rx) = bounded::<CaptureError>(16);
        self.error_rx = Some(error_rx);
        let (ready_tx, ready_rx) = bounded::<Result<(), CaptureError>>(1);

        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::F32 => build_stream::<f32>(&device, &config, producer, error_tx),
                    SampleFormat::I16 => build_stream::<i16>(&device, &config, producer, error_tx),
                    other => {
                        let _ = ready_tx.send(Err(CaptureError::UnsupportedFormat(format!(
                            "{:?} samples",
                            other
                        ))));
                        return;
                    }
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(CaptureError::Stream(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CaptureError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            });
        match handle {
            Ok(handle) => self.thread_handle = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(CaptureError::Stream(e.to_string()));
            }
        }

        let started = ready_rx
            .recv_timeout(START_TIMEOUT)
            .unwrap_or_else(|_| Err(CaptureError::Stream("capture thread did not start".to_string())));
        match started {
            Ok(()) => {
                tracing::info!(
                    device = self.device_name.as_deref().unwrap_or("default"),
                    "Microphone capture started"
                );
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("Microphone capture stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
