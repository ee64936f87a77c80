use serde::{Deserialize, Serialize};

use super::error::CaptureError;

/// Size in bytes of one float32 sample.
pub const SAMPLE_SIZE: usize = std::mem::size_of::<f32>();

/// Sample representation negotiated with the HAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    Float32Interleaved,
    Float32NonInterleaved,
}

/// Negotiated audio format of a device or tap.
///
/// Recomputed on every activation and frozen for the lifetime of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub sample_rate: f64,
    pub channels: u32,
    pub format: SampleFormat,
}

impl StreamDescription {
    pub fn new(sample_rate: f64, channels: u32, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            format,
        }
    }

    pub fn interleaved(sample_rate: f64, channels: u32) -> Self {
        Self::new(sample_rate, channels, SampleFormat::Float32Interleaved)
    }

    /// Reject zero, negative or non-finite rates and empty channel layouts.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(CaptureError::InvalidFormat(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.channels == 0 {
            return Err(CaptureError::InvalidFormat("channel count must be at least 1".into()));
        }
        Ok(())
    }

    /// Bytes per interleaved frame.
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * SAMPLE_SIZE
    }

    /// The same rate with a different channel layout, always interleaved.
    pub fn with_channels(&self, channels: u32) -> Self {
        Self::interleaved(self.sample_rate, channels)
    }
}
