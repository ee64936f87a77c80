use serde::{Deserialize, Serialize};

/// Real-time audio level metering (RMS and peak) for the two input streams and the mix.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AudioLevels {
    pub primary_level: f32,
    pub secondary_level: f32,
    pub mix_level: f32,
    pub peak_primary_level: f32,
    pub peak_secondary_level: f32,
    pub peak_mix_level: f32,
}

/// Counters collected by the I/O callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaptureSessionDiagnostics {
    pub callback_count: u64,
    /// Invocations delivering fewer than two buffer groups.
    pub short_deliveries: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub write_errors: u64,
}
