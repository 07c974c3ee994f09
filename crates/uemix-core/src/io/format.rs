//! Wire encodings for sample payloads.
//!
//! A reply message carries one block as a contiguous run of samples with no
//! header; the sample count is the payload length divided by
//! [`IqFormat::bytes_per_sample`].
//!
//! | Format | Bytes/Sample | Description |
//! |--------|--------------|-------------|
//! | Cf32   | 8            | Complex float32, `gr_complex` compatible (default) |
//! | Cf64   | 16           | Complex float64 |
//! | Ci16   | 4            | Complex int16, [-1.0, 1.0] scaled by 32767 |
//!
//! # Example
//!
//! ```rust
//! use uemix_core::io::IqFormat;
//! use uemix_core::types::Sample;
//!
//! let format: IqFormat = "cf32".parse().unwrap();
//! let payload = format.encode(&[Sample::new(0.5, -0.5)]);
//! assert_eq!(payload.len(), 8);
//! assert_eq!(format.decode(&payload).unwrap(), vec![Sample::new(0.5, -0.5)]);
//! ```

use crate::types::{Sample, SampleBlock};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding a payload or parsing a format name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Payload is not a whole number of samples
    #[error("payload of {len} bytes is not a multiple of {bytes_per_sample}-byte {format} samples")]
    PartialSample {
        format: IqFormat,
        len: usize,
        bytes_per_sample: usize,
    },

    /// Unknown format name
    #[error("unknown sample format '{0}' (expected cf32, cf64 or ci16)")]
    Unknown(String),
}

/// Sample encoding used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IqFormat {
    /// Complex float32 (8 bytes/sample)
    #[default]
    Cf32,

    /// Complex float64 (16 bytes/sample)
    Cf64,

    /// Complex signed int16 (4 bytes/sample)
    Ci16,
}

impl IqFormat {
    /// Size of one I/Q sample in bytes, both components included.
    #[inline]
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            IqFormat::Cf32 => 8,
            IqFormat::Cf64 => 16,
            IqFormat::Ci16 => 4,
        }
    }

    /// Short name used in configuration files and logs.
    pub const fn short_name(&self) -> &'static str {
        match self {
            IqFormat::Cf32 => "cf32",
            IqFormat::Cf64 => "cf64",
            IqFormat::Ci16 => "ci16",
        }
    }

    /// Encode a block into a payload.
    pub fn encode(&self, samples: &[Sample]) -> Vec<u8> {
        let mut data = Vec::with_capacity(samples.len() * self.bytes_per_sample());

        for sample in samples {
            match self {
                IqFormat::Cf32 => {
                    data.extend_from_slice(&sample.re.to_le_bytes());
                    data.extend_from_slice(&sample.im.to_le_bytes());
                }
                IqFormat::Cf64 => {
                    data.extend_from_slice(&(sample.re as f64).to_le_bytes());
                    data.extend_from_slice(&(sample.im as f64).to_le_bytes());
                }
                IqFormat::Ci16 => {
                    // Scale: [-1.0, 1.0] -> [-32767, 32767], clamp to i16 range
                    let re = (sample.re * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    let im = (sample.im * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    data.extend_from_slice(&re.to_le_bytes());
                    data.extend_from_slice(&im.to_le_bytes());
                }
            }
        }

        data
    }

    /// Decode a payload into a block.
    pub fn decode(&self, data: &[u8]) -> Result<SampleBlock, FormatError> {
        let bytes_per_sample = self.bytes_per_sample();
        if data.len() % bytes_per_sample != 0 {
            return Err(FormatError::PartialSample {
                format: *self,
                len: data.len(),
                bytes_per_sample,
            });
        }

        let half = bytes_per_sample / 2;
        let samples = data
            .chunks_exact(bytes_per_sample)
            .map(|chunk| {
                let (i, q) = chunk.split_at(half);
                match self {
                    IqFormat::Cf32 => Sample::new(le_f32(i), le_f32(q)),
                    IqFormat::Cf64 => Sample::new(le_f64(i) as f32, le_f64(q) as f32),
                    IqFormat::Ci16 => Sample::new(le_i16(i) / 32768.0, le_i16(q) / 32768.0),
                }
            })
            .collect();

        Ok(samples)
    }
}

// `chunks_exact` + `split_at` guarantee the slice widths below.
fn le_f32(b: &[u8]) -> f32 {
    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_f64(b: &[u8]) -> f64 {
    f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn le_i16(b: &[u8]) -> f32 {
    i16::from_le_bytes([b[0], b[1]]) as f32
}

impl std::fmt::Display for IqFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

impl std::str::FromStr for IqFormat {
    type Err = FormatError;

    /// Accepts the short names plus the usual aliases
    /// (`gr_complex`, `complex64`, `sc16`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cf32" | "cf32_le" | "f32" | "float" | "gr_complex" => Ok(IqFormat::Cf32),
            "cf64" | "cf64_le" | "f64" | "complex64" => Ok(IqFormat::Cf64),
            "ci16" | "ci16_le" | "i16" | "sc16" | "short" => Ok(IqFormat::Ci16),
            _ => Err(FormatError::Unknown(s.to_string())),
        }
    }
}
