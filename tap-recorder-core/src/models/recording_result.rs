use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::stream::StreamDescription;
use super::target::CaptureTarget;

/// Result returned when a capture session stops and its file is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingResult {
    pub id: String,
    pub file_path: PathBuf,
    pub target: CaptureTarget,
    pub format: StreamDescription,
    pub frames_written: u64,
    pub duration_secs: f64,
    /// SHA-256 hex digest of the finished file.
    pub checksum: String,
    pub created_at: String,
}

impl RecordingResult {
    pub fn file_name(&self) -> String {
        self.file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
