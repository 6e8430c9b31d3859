//! PCM stream format descriptor
//!
//! A snapshot of the sender's live capture format, shipped to the receiver
//! inside a `StartCapturingAudioStream` action so it can configure its sink.
//! The wire layout is fixed: eight little-endian `u32` fields followed by a
//! little-endian `f64`, in declaration order.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};

/// Four-character code for linear PCM (`'lpcm'`).
pub const FORMAT_LINEAR_PCM: u32 = u32::from_be_bytes(*b"lpcm");

/// Format flag bits, as used by CoreAudio stream descriptions.
pub mod flags {
    pub const IS_FLOAT: u32 = 1 << 0;
    pub const IS_BIG_ENDIAN: u32 = 1 << 1;
    pub const IS_SIGNED_INTEGER: u32 = 1 << 2;
    pub const IS_PACKED: u32 = 1 << 3;
    pub const IS_ALIGNED_HIGH: u32 = 1 << 4;
    pub const IS_NON_INTERLEAVED: u32 = 1 << 5;
    pub const IS_NON_MIXABLE: u32 = 1 << 6;

    /// Big-endian flag on big-endian targets, zero otherwise.
    pub const NATIVE_ENDIAN: u32 = if cfg!(target_endian = "big") {
        IS_BIG_ENDIAN
    } else {
        0
    };
}

/// Sample representation for [`FormatDescriptor::linear_pcm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Float,
    SignedInteger,
}

/// Serializable description of a PCM stream's sample layout.
///
/// Field values are carried verbatim; nothing here checks that they agree
/// with each other (see [`FormatDescriptor::has_consistent_frame_size`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub bits_per_channel: u32,
    pub bytes_per_frame: u32,
    pub bytes_per_packet: u32,
    pub channels_per_frame: u32,
    pub format_flags: u32,
    pub format_id: u32,
    pub frames_per_packet: u32,
    pub reserved: u32,
    pub sample_rate: f64,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

impl FormatDescriptor {
    /// Size of the encoded form in bytes.
    pub const ENCODED_LEN: usize = 8 * 4 + 8;

    /// Packed, interleaved, native-endian linear PCM.
    pub fn linear_pcm(sample_rate: f64, channels: u32, bits: u32, kind: SampleKind) -> Self {
        let kind_flag = match kind {
            SampleKind::Float => flags::IS_FLOAT,
            SampleKind::SignedInteger => flags::IS_SIGNED_INTEGER,
        };
        let bytes_per_frame = channels * bits.div_ceil(8);

        Self {
            bits_per_channel: bits,
            bytes_per_frame,
            bytes_per_packet: bytes_per_frame,
            channels_per_frame: channels,
            format_flags: kind_flag | flags::IS_PACKED | flags::NATIVE_ENDIAN,
            format_id: FORMAT_LINEAR_PCM,
            frames_per_packet: 1,
            reserved: 0,
            sample_rate,
        }
    }

    /// Serialize to the fixed 40-byte wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(wire_options().serialize(self)?)
    }

    /// Parse the fixed wire layout, rejecting any other length.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(DecodeError::malformed(format!(
                "format descriptor must be {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }

        wire_options()
            .deserialize(bytes)
            .map_err(|e| DecodeError::malformed(format!("format descriptor: {e}")))
    }

    /// The format ID rendered as its four-character code.
    pub fn format_id_code(&self) -> String {
        self.format_id
            .to_be_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
            .collect()
    }

    pub fn is_linear_pcm(&self) -> bool {
        self.format_id == FORMAT_LINEAR_PCM
    }

    pub fn is_float(&self) -> bool {
        self.format_flags & flags::IS_FLOAT != 0
    }

    pub fn is_signed_integer(&self) -> bool {
        self.format_flags & flags::IS_SIGNED_INTEGER != 0
    }

    pub fn is_big_endian(&self) -> bool {
        self.format_flags & flags::IS_BIG_ENDIAN != 0
    }

    pub fn is_non_interleaved(&self) -> bool {
        self.format_flags & flags::IS_NON_INTERLEAVED != 0
    }

    /// Storage width of one sample in bytes.
    pub fn bytes_per_sample(&self) -> u32 {
        self.bits_per_channel.div_ceil(8)
    }

    /// Whether `bytes_per_frame == channels_per_frame * bits_per_channel / 8`.
    pub fn has_consistent_frame_size(&self) -> bool {
        self.channels_per_frame
            .checked_mul(self.bytes_per_sample())
            .is_some_and(|expected| expected == self.bytes_per_frame)
    }

    /// Byte granularity the receive side drains in; never zero.
    pub fn frame_alignment(&self) -> usize {
        (self.bytes_per_frame as usize).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mono_f32() -> FormatDescriptor {
        FormatDescriptor {
            bits_per_channel: 32,
            bytes_per_frame: 4,
            bytes_per_packet: 4,
            channels_per_frame: 1,
            format_flags: flags::IS_FLOAT | flags::IS_PACKED,
            format_id: FORMAT_LINEAR_PCM,
            frames_per_packet: 1,
            reserved: 0,
            sample_rate: 44100.0,
        }
    }

    #[test]
    fn test_encoded_layout() {
        let bytes = mono_f32().encode().unwrap();
        assert_eq!(bytes.len(), FormatDescriptor::ENCODED_LEN);
        assert_eq!(&bytes[0..4], &32u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &FORMAT_LINEAR_PCM.to_le_bytes());
        assert_eq!(&bytes[32..40], &44100.0f64.to_le_bytes());
    }

    #[test]
    fn test_roundtrip_extremes() {
        let zero = FormatDescriptor {
            bits_per_channel: 0,
            bytes_per_frame: 0,
            bytes_per_packet: 0,
            channels_per_frame: 0,
            format_flags: 0,
            format_id: 0,
            frames_per_packet: 0,
            reserved: 0,
            sample_rate: 0.0,
        };
        let max = FormatDescriptor {
            bits_per_channel: u32::MAX,
            bytes_per_frame: u32::MAX,
            bytes_per_packet: u32::MAX,
            channels_per_frame: u32::MAX,
            format_flags: u32::MAX,
            format_id: u32::MAX,
            frames_per_packet: u32::MAX,
            reserved: u32::MAX,
            sample_rate: f64::MAX,
        };

        for original in [zero, max, mono_f32()] {
            let decoded = FormatDescriptor::decode(&original.encode().unwrap()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_nan_sample_rate_preserves_bits() {
        let mut desc = mono_f32();
        desc.sample_rate = f64::NAN;
        let decoded = FormatDescriptor::decode(&desc.encode().unwrap()).unwrap();
        assert_eq!(decoded.sample_rate.to_bits(), desc.sample_rate.to_bits());
    }

    #[test]
    fn test_rejects_wrong_length() {
        let bytes = mono_f32().encode().unwrap();

        let short = FormatDescriptor::decode(&bytes[..39]);
        assert!(matches!(short, Err(DecodeError::Malformed(_))));

        let mut long = bytes.clone();
        long.push(0);
        assert!(matches!(FormatDescriptor::decode(&long), Err(DecodeError::Malformed(_))));

        assert!(FormatDescriptor::decode(&[]).is_err());
    }

    #[test]
    fn test_linear_pcm_helpers() {
        let desc = FormatDescriptor::linear_pcm(48000.0, 2, 16, SampleKind::SignedInteger);
        assert_eq!(desc.bytes_per_frame, 4);
        assert!(desc.is_linear_pcm());
        assert!(desc.is_signed_integer());
        assert!(!desc.is_float());
        assert!(desc.has_consistent_frame_size());
        assert_eq!(desc.format_id_code(), "lpcm");
        assert_eq!(desc.frame_alignment(), 4);
    }

    #[test]
    fn test_inconsistent_frame_size_is_carried_verbatim() {
        let mut desc = mono_f32();
        desc.bytes_per_frame = 7;
        assert!(!desc.has_consistent_frame_size());
        let decoded = FormatDescriptor::decode(&desc.encode().unwrap()).unwrap();
        assert_eq!(decoded.bytes_per_frame, 7);
    }

    fn finite_or_infinite() -> impl Strategy<Value = f64> {
        prop::num::f64::NORMAL
            | prop::num::f64::SUBNORMAL
            | prop::num::f64::ZERO
            | prop::num::f64::INFINITE
    }

    prop_compose! {
        fn any_descriptor()(
            ints in prop::array::uniform8(any::<u32>()),
            sample_rate in finite_or_infinite(),
        ) -> FormatDescriptor {
            FormatDescriptor {
                bits_per_channel: ints[0],
                bytes_per_frame: ints[1],
                bytes_per_packet: ints[2],
                channels_per_frame: ints[3],
                format_flags: ints[4],
                format_id: ints[5],
                frames_per_packet: ints[6],
                reserved: ints[7],
                sample_rate,
            }
        }
    }

    proptest! {
        #[test]
        fn prop_descriptor_roundtrip(desc in any_descriptor()) {
            let decoded = FormatDescriptor::decode(&desc.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, desc);
        }

        #[test]
        fn prop_wrong_length_rejected(bytes in prop::collection::vec(any::<u8>(), 0..80)) {
            prop_assume!(bytes.len() != FormatDescriptor::ENCODED_LEN);
            prop_assert!(FormatDescriptor::decode(&bytes).is_err());
        }
    }
}
