//! Raw PCM chunks as received from clients.

use crate::error::{LivescribeError, Result};
use serde::{Deserialize, Serialize};

/// A chunk of little-endian 16-bit PCM audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioChunk {
    /// Build a validated chunk.
    pub fn new(data: Vec<u8>, sample_rate: u32, channels: u16) -> Result<Self> {
        let chunk = Self {
            data,
            sample_rate,
            channels,
        };
        chunk.validate()?;
        Ok(chunk)
    }

    /// Mono chunk, the wire format of the streaming endpoint.
    pub fn mono(data: Vec<u8>, sample_rate: u32) -> Result<Self> {
        Self::new(data, sample_rate, 1)
    }

    /// Build a chunk from samples. Used by tests and diagnostics.
    pub fn from_samples(samples: &[i16], sample_rate: u32) -> Self {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self {
            data,
            sample_rate,
            channels: 1,
        }
    }

    /// Non-empty, positive rate, mono or stereo.
    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(invalid("chunk is empty"));
        }
        if self.sample_rate == 0 {
            return Err(invalid("sample rate must be positive"));
        }
        if !matches!(self.channels, 1 | 2) {
            return Err(invalid(&format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        Ok(())
    }

    /// Decode into mono samples, averaging stereo frames.
    pub fn to_mono_samples(&self) -> Result<Vec<i16>> {
        self.validate()?;
        let frame_bytes = 2 * self.channels as usize;
        if self.data.len() % frame_bytes != 0 {
            return Err(invalid(&format!(
                "{} bytes is not a whole number of {}-channel 16-bit frames",
                self.data.len(),
                self.channels
            )));
        }

        let samples = self
            .data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]));

        if self.channels == 1 {
            return Ok(samples.collect());
        }

        let interleaved: Vec<i16> = samples.collect();
        Ok(interleaved
            .chunks_exact(2)
            .map(|frame| ((frame[0] as i32 + frame[1] as i32) / 2) as i16)
            .collect())
    }

    /// Duration in milliseconds, ignoring any trailing partial frame.
    pub fn duration_ms(&self) -> f64 {
        let frame_bytes = 2 * self.channels.max(1) as usize;
        let frames = self.data.len() / frame_bytes;
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 * 1000.0 / self.sample_rate as f64
    }
}

fn invalid(message: &str) -> LivescribeError {
    LivescribeError::InvalidAudio {
        message: message.to_string(),
    }
}

/// Root mean square of 16-bit samples, normalized to 0.0..=1.0.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Convert 16-bit samples to the -1.0..1.0 float range used by inference engines.
pub fn to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}
