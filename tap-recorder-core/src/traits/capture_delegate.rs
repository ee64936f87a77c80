use std::path::Path;

use crate::models::error::{CaptureError, UploadError};
use crate::models::recording_result::RecordingResult;
use crate::models::state::TapState;
use crate::models::target::CaptureTarget;
use crate::models::upload::{TaskId, UploadResponse};

/// Event delegate for tap and capture session notifications.
///
/// Methods are called from the control thread that caused the change, never
/// from the real-time I/O thread. Implementations should marshal to a UI
/// thread if needed.
pub trait CaptureDelegate: Send + Sync {
    /// Called once per tap state transition.
    fn on_tap_state_changed(&self, target: &CaptureTarget, state: TapState);

    /// Called when a session has opened its file and started the device.
    fn on_recording_started(&self, path: &Path);

    /// Called when a session stops and the file is finalized.
    fn on_recording_finished(&self, result: &RecordingResult);

    /// Called for non-fatal errors, including write failures drained from the I/O thread.
    fn on_error(&self, error: &CaptureError);
}

/// Event delegate for uploads started by the recorder.
///
/// Called from transport threads.
pub trait UploadDelegate: Send + Sync {
    fn on_upload_progress(&self, task: TaskId, path: &Path, fraction: f64);

    fn on_upload_finished(&self, task: TaskId, path: &Path, result: &Result<UploadResponse, UploadError>);
}
