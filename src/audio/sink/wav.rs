//! WAV file sink

use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use super::{AudioSink, SinkOpener};
use crate::error::SinkError;
use crate::protocol::FormatDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Int8,
    Int16,
    Int24,
    Int32,
    Float32,
}

/// How incoming bytes map onto samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SampleLayout {
    encoding: Encoding,
    width: usize,
    big_endian: bool,
}

fn unsupported(reason: impl Into<String>) -> SinkError {
    SinkError::UnsupportedFormat(reason.into())
}

/// Work out the WAV header and byte layout for a stream format.
fn wav_layout(format: &FormatDescriptor) -> Result<(WavSpec, SampleLayout), SinkError> {
    if !format.is_linear_pcm() {
        return Err(unsupported(format!("format id '{}'", format.format_id_code())));
    }

    let channels = u16::try_from(format.channels_per_frame)
        .ok()
        .filter(|&c| c > 0)
        .ok_or_else(|| unsupported(format!("{} channels", format.channels_per_frame)))?;

    if !format.sample_rate.is_finite() || format.sample_rate < 1.0 || format.sample_rate > u32::MAX as f64 {
        return Err(unsupported(format!("sample rate {}", format.sample_rate)));
    }

    if format.is_non_interleaved() && channels > 1 {
        return Err(unsupported("non-interleaved audio"));
    }

    let encoding = match (format.is_float(), format.is_signed_integer(), format.bits_per_channel) {
        (true, _, 32) => Encoding::Float32,
        (false, true, 8) => Encoding::Int8,
        (false, true, 16) => Encoding::Int16,
        (false, true, 24) => Encoding::Int24,
        (false, true, 32) => Encoding::Int32,
        (is_float, _, bits) => {
            let kind = if is_float { "float" } else if format.is_signed_integer() { "integer" } else { "unsigned integer" };
            return Err(unsupported(format!("{}-bit {}", bits, kind)));
        }
    };

    if !format.has_consistent_frame_size() {
        return Err(unsupported(format!(
            "{} bytes per frame for {} x {}-bit channels",
            format.bytes_per_frame, format.channels_per_frame, format.bits_per_channel
        )));
    }

    let spec = WavSpec {
        channels,
        sample_rate: format.sample_rate.round() as u32,
        bits_per_sample: format.bits_per_channel as u16,
        sample_format: if encoding == Encoding::Float32 {
            SampleFormat::Float
        } else {
            SampleFormat::Int
        },
    };
    let layout = SampleLayout {
        encoding,
        width: format.bytes_per_sample() as usize,
        big_endian: format.is_big_endian(),
    };
    Ok((spec, layout))
}

fn write_sample(
    writer: &mut WavWriter<BufWriter<File>>,
    layout: SampleLayout,
    raw: &[u8],
) -> Result<(), hound::Error> {
    let mut bytes = [0u8; 4];
    bytes[..raw.len()].copy_from_slice(raw);
    // Normalise to big-endian byte order.
    if !layout.big_endian {
        bytes[..raw.len()].reverse();
    }

    match layout.encoding {
        Encoding::Int8 => writer.write_sample(bytes[0] as i8),
        Encoding::Int16 => writer.write_sample(i16::from_be_bytes([bytes[0], bytes[1]])),
        Encoding::Int24 => {
            let value = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]) >> 8;
            writer.write_sample(value)
        }
        Encoding::Int32 => writer.write_sample(i32::from_be_bytes(bytes)),
        Encoding::Float32 => writer.write_sample(f32::from_bits(u32::from_be_bytes(bytes))),
    }
}

/// Writes received PCM into a WAV file
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    layout: SampleLayout,
    /// Trailing bytes of a sample split across appends.
    pending: Vec<u8>,
    path: PathBuf,
}

impl WavSink {
    /// Create (or overwrite) the file at `path`.
    pub fn create(path: &Path, format: &FormatDescriptor) -> Result<Self, SinkError> {
        let (spec, layout) = wav_layout(format)?;
        let writer = WavWriter::create(path, spec)?;
        tracing::info!(
            path = %path.display(),
            channels = spec.channels,
            sample_rate = spec.sample_rate,
            bits = spec.bits_per_sample,
            "Recording to WAV"
        );

        Ok(Self {
            writer: Some(writer),
            layout,
            pending: Vec::with_capacity(layout.width),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write every complete sample at the front of `pending` and drop the ones
/// written. Stops at the first failure, leaving that sample and everything
/// after it in `pending`.
fn write_whole_samples<E>(
    pending: &mut Vec<u8>,
    width: usize,
    mut write: impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    let whole = pending.len() - pending.len() % width;
    let mut written = 0;
    let result = pending[..whole].chunks_exact(width).try_for_each(|sample| {
        write(sample)?;
        written += width;
        Ok(())
    });
    pending.drain(..written);
    result
}

impl AudioSink for WavSink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        let width = self.layout.width;

        let layout = self.layout;

        self.pending.extend_from_slice(bytes);
        write_whole_samples(&mut self.pending, width, |sample| {
            write_sample(writer, layout, sample)
        })?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        if !self.pending.is_empty() {
            tracing::debug!(bytes = self.pending.len(), "Discarding partial sample at end of recording");
            self.pending.clear();
        }
        writer.finalize()?;
        tracing::info!(path = %self.path.display(), "Recording finalized");
        Ok(())
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to finalize recording");
        }
    }
}

/// Opens a [`WavSink`] per receive session
#[derive(Debug, Clone, Copy, Default)]
pub struct WavSinkOpener;

impl SinkOpener for WavSinkOpener {
    fn open(&mut self, path: &Path, format: &FormatDescriptor) -> Result<Box<dyn AudioSink>, SinkError> {
        Ok(Box::new(WavSink::create(path, format)?))
    }
}
