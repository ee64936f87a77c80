use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::models::audio_models::{AudioLevels, CaptureSessionDiagnostics};
use crate::models::config::CaptureConfiguration;
use crate::models::error::{CaptureError, UploadError};
use crate::models::recording_result::RecordingResult;
use crate::models::target::CaptureTarget;
use crate::models::upload::TaskId;
use crate::session::capture::CaptureSession;
use crate::session::tap_manager::TapManager;
use crate::storage::wav_writer::WavFileWriter;
use crate::traits::capture_delegate::{CaptureDelegate, UploadDelegate};
use crate::traits::file_sink::FileSink;
use crate::traits::hal_gateway::HalGateway;
use crate::upload::multiplexer::{UploadHandle, UploadMultiplexer};

struct ActiveRecording<H: HalGateway, S: FileSink> {
    tap: Arc<TapManager<Arc<H>>>,
    session: CaptureSession<Arc<H>, S>,
}

/// Application-level service wiring tap, capture session and uploads.
///
/// Construct once and share by `Arc`. Each recording gets a fresh tap
/// (taps are single-use once invalidated); finished files are handed to the
/// upload multiplexer when one is configured.
pub struct Recorder<H: HalGateway, S: FileSink = WavFileWriter> {
    hal: Arc<H>,
    config: CaptureConfiguration,
    uploader: Option<Arc<UploadMultiplexer>>,
    active: Mutex<Option<ActiveRecording<H, S>>>,
    starting: AtomicBool,
    delegate: Mutex<Option<Arc<dyn CaptureDelegate>>>,
    upload_delegate: Mutex<Option<Arc<dyn UploadDelegate>>>,
}

impl<H: HalGateway, S: FileSink> Recorder<H, S> {
    pub fn new(hal: Arc<H>, config: CaptureConfiguration) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;
        Ok(Self {
            hal,
            config,
            uploader: None,
            active: Mutex::new(None),
            starting: AtomicBool::new(false),
            delegate: Mutex::new(None),
            upload_delegate: Mutex::new(None),
        })
    }

    /// Upload every finished recording through `uploader`.
    pub fn with_uploader(mut self, uploader: Arc<UploadMultiplexer>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn set_delegate(&self, delegate: Arc<dyn CaptureDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    pub fn set_upload_delegate(&self, delegate: Arc<dyn UploadDelegate>) {
        *self.upload_delegate.lock() = Some(delegate);
    }

    pub fn config(&self) -> &CaptureConfiguration {
        &self.config
    }

    pub fn uploader(&self) -> Option<&Arc<UploadMultiplexer>> {
        self.uploader.as_ref()
    }

    pub fn is_recording(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.session.is_running())
            .unwrap_or(false)
    }

    /// Destination of the recording in progress.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.session.output_path().to_path_buf())
    }

    pub fn levels(&self) -> AudioLevels {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.session.levels())
            .unwrap_or_default()
    }

    pub fn diagnostics(&self) -> CaptureSessionDiagnostics {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.session.diagnostics())
            .unwrap_or_default()
    }

    /// Advisory errors from the running session. Also forwarded to the delegate.
    pub fn drain_errors(&self) -> Vec<CaptureError> {
        let errors = self
            .active
            .lock()
            .as_ref()
            .map(|a| a.session.drain_errors())
            .unwrap_or_default();
        if let Some(delegate) = self.delegate.lock().clone() {
            for error in &errors {
                delegate.on_error(error);
            }
        }
        errors
    }

    /// Activate a tap for `target` and start recording into a new file.
    ///
    /// Delegate callbacks run without any recorder lock held, so they may
    /// query the recorder.
    pub fn start_recording(&self, target: CaptureTarget) -> Result<PathBuf, CaptureError> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaptureError::AlreadyRunning);
        }
        if self.active.lock().is_some() {
            self.starting.store(false, Ordering::SeqCst);
            return Err(CaptureError::AlreadyRunning);
        }

        let outcome = self.begin_recording(target).map(|recording| {
            let path = recording.session.output_path().to_path_buf();
            *self.active.lock() = Some(recording);
            path
        });
        self.starting.store(false, Ordering::SeqCst);
        outcome
    }

    fn begin_recording(&self, target: CaptureTarget) -> Result<ActiveRecording<H, S>, CaptureError> {
        let delegate = self.delegate.lock().clone();
        let tap = Arc::new(TapManager::new(Arc::clone(&self.hal), &self.config));
        if let Some(ref delegate) = delegate {
            tap.set_delegate(Arc::clone(delegate));
        }
        tap.activate(&target)?;

        let path = self.config.next_recording_path();
        let mut session: CaptureSession<Arc<H>, S> = CaptureSession::new(Arc::clone(&tap), target, path);
        session.set_error_capacity(self.config.error_channel_capacity);
        if let Some(delegate) = delegate {
            session.set_delegate(delegate);
        }

        if let Err(e) = session.start() {
            drop(session);
            tap.invalidate();
            return Err(e);
        }
        Ok(ActiveRecording { tap, session })
    }

    /// Stop the current recording, tear the tap down and queue the upload.
    pub fn stop_recording(&self) -> Result<RecordingResult, CaptureError> {
        let ActiveRecording { tap, mut session } = self.active.lock().take().ok_or(CaptureError::NotStarted)?;

        let result = session.stop();
        drop(session);
        tap.invalidate();
        let result = result?;

        if self.uploader.is_some() {
            if let Err(e) = self.upload_recording(&result) {
                log::error!("Failed to start upload of {}: {}", result.file_path.display(), e);
            }
        }
        Ok(result)
    }

    /// Start uploading a finished recording.
    ///
    /// The upload delegate, if set, receives progress and the final result.
    pub fn upload_recording(&self, recording: &RecordingResult) -> Result<UploadHandle, UploadError> {
        let uploader = self
            .uploader
            .as_ref()
            .ok_or_else(|| UploadError::Configuration("no upload endpoint configured".into()))?;

        let Some(delegate) = self.upload_delegate.lock().clone() else {
            return uploader.start_upload(&recording.file_path, |_| {});
        };

        let handle = uploader.start_upload_with_delegate(&recording.file_path, Arc::clone(&delegate))?;
        let waiter = UploadWaiter {
            task: handle.task_id(),
            path: handle.path().to_path_buf(),
        };
        Ok(waiter.watch(handle, delegate))
    }
}

/// Forwards a task's result to the upload delegate from a background thread.
struct UploadWaiter {
    task: TaskId,
    path: PathBuf,
}

impl UploadWaiter {
    /// Consumes `handle` on a watcher thread and returns a detached twin for the caller.
    fn watch(self, handle: UploadHandle, delegate: Arc<dyn UploadDelegate>) -> UploadHandle {
        let (twin, relay) = UploadHandle::relay(self.task, self.path.clone());
        let spawned = thread::Builder::new()
            .name(format!("upload-wait-{}", self.task.0))
            .spawn(move || {
                let result = handle.wait();
                delegate.on_upload_finished(self.task, &self.path, &result);
                let _ = relay.send(result);
            });
        if let Err(e) = spawned {
            log::error!("Failed to spawn upload watcher for {}: {}", self.task, e);
        }
        twin
    }
}

impl<H: HalGateway, S: FileSink> Drop for Recorder<H, S> {
    fn drop(&mut self) {
        if let Some(ActiveRecording { tap, mut session }) = self.active.get_mut().take() {
            if let Err(e) = session.stop() {
                log::error!("Failed to stop recording on shutdown: {}", e);
            }
            drop(session);
            tap.invalidate();
        }
    }
}
