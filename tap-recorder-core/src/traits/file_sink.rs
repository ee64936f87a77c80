use std::path::{Path, PathBuf};

use crate::models::error::CaptureError;
use crate::models::stream::StreamDescription;

/// Summary returned when a sink is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSummary {
    pub path: PathBuf,
    /// Frames in the finalized file.
    pub frames_written: u64,
    /// Frames accepted by `write_frames` that never reached storage.
    pub frames_lost: u64,
    pub checksum: String,
}

/// Destination for mixed audio frames.
///
/// `write_frames` is called from the real-time I/O thread with interleaved
/// samples; implementations must append without seeking or reopening.
pub trait FileSink: Send + Sized + 'static {
    /// Create the file at `path` for exactly `format`. Never resamples.
    fn open(path: &Path, format: &StreamDescription) -> Result<Self, CaptureError>;

    fn write_frames(&mut self, samples: &[f32]) -> Result<(), CaptureError>;

    /// Flush and finalize any container header.
    ///
    /// If storage fails during the flush, the header still describes the
    /// frames that reached it and the shortfall is reported in `frames_lost`.
    fn close(&mut self) -> Result<SinkSummary, CaptureError>;

    fn path(&self) -> &Path;
}
