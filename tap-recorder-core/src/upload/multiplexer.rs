use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::config::UploadConfiguration;
use crate::models::error::UploadError;
use crate::models::upload::{TaskId, UploadResponse};
use crate::traits::capture_delegate::UploadDelegate;
use crate::traits::transport::{Transport, TransportDelegate, TransportError, TransportRequest};
use crate::upload::multipart;
use crate::upload::transport::HttpTransport;

pub type UploadResult = Result<UploadResponse, UploadError>;

/// Progress observer for one task, called with the sent fraction in `[0, 1]`.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Progress observation attached to one task. Dropped when the task retires.
struct ProgressSubscription {
    callback: ProgressCallback,
    last_fraction: f64,
}

#[derive(Default)]
struct Tables {
    continuations: HashMap<TaskId, SyncSender<UploadResult>>,
    progress: HashMap<TaskId, ProgressSubscription>,
    bodies: HashMap<TaskId, Vec<u8>>,
}

/// Sizes of the per-task maps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackedTasks {
    pub continuations: usize,
    pub progress_handlers: usize,
    pub response_bodies: usize,
}

impl TrackedTasks {
    pub fn is_empty(&self) -> bool {
        self.continuations == 0 && self.progress_handlers == 0 && self.response_bodies == 0
    }
}

/// Routes the shared transport's callbacks to the task they belong to.
///
/// All three maps sit behind one lock so a task is registered and retired
/// atomically. Observers are invoked after the lock is released.
#[derive(Default)]
pub struct TaskRegistry {
    tables: Mutex<Tables>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, task: TaskId, continuation: SyncSender<UploadResult>, callback: ProgressCallback) {
        let mut tables = self.tables.lock();
        tables.continuations.insert(task, continuation);
        tables.progress.insert(
            task,
            ProgressSubscription {
                callback,
                last_fraction: 0.0,
            },
        );
        tables.bodies.insert(task, Vec::new());
    }

    pub fn tracked(&self) -> TrackedTasks {
        let tables = self.tables.lock();
        TrackedTasks {
            continuations: tables.continuations.len(),
            progress_handlers: tables.progress.len(),
            response_bodies: tables.bodies.len(),
        }
    }

    /// Last fraction reported for a live task.
    pub fn progress(&self, task: TaskId) -> Option<f64> {
        self.tables.lock().progress.get(&task).map(|p| p.last_fraction)
    }
}

fn fraction(sent: u64, expected: u64) -> f64 {
    if expected == 0 {
        return 1.0;
    }
    (sent as f64 / expected as f64).clamp(0.0, 1.0)
}

fn classify(outcome: Result<u16, TransportError>, body: &[u8]) -> UploadResult {
    let status = outcome.map_err(|e| UploadError::Network(e.0))?;
    if !(200..300).contains(&status) {
        return Err(UploadError::BadStatus(status));
    }
    serde_json::from_slice::<UploadResponse>(body).map_err(|e| UploadError::DecodingFailed(e.to_string()))
}

impl TransportDelegate for TaskRegistry {
    fn did_send_body_data(&self, task: TaskId, total_bytes_sent: u64, total_bytes_expected: u64) {
        let value = fraction(total_bytes_sent, total_bytes_expected);
        let callback = {
            let mut tables = self.tables.lock();
            let Some(subscription) = tables.progress.get_mut(&task) else {
                log::debug!("Progress for untracked {}", task);
                return;
            };
            subscription.last_fraction = value;
            Arc::clone(&subscription.callback)
        };
        callback(value);
    }

    fn did_receive_data(&self, task: TaskId, data: &[u8]) {
        let mut tables = self.tables.lock();
        match tables.bodies.get_mut(&task) {
            Some(body) => body.extend_from_slice(data),
            None => log::debug!("Response data for untracked {}", task),
        }
    }

    fn did_complete(&self, task: TaskId, outcome: Result<u16, TransportError>) {
        let (continuation, body) = {
            let mut tables = self.tables.lock();
            let continuation = tables.continuations.remove(&task);
            tables.progress.remove(&task);
            let body = tables.bodies.remove(&task).unwrap_or_default();
            (continuation, body)
        };

        let Some(continuation) = continuation else {
            log::debug!("Completion for untracked {}", task);
            return;
        };

        let result = classify(outcome, &body);
        match &result {
            Ok(response) => log::info!("{} uploaded to {}", task, response.upload_url()),
            Err(e) => log::warn!("{} failed: {}", task, e),
        }

        if continuation.send(result).is_err() {
            log::debug!("{} finished after its caller detached", task);
        }
    }
}

/// Caller's side of one in-flight upload.
///
/// Dropping the handle detaches; the transfer still runs to completion and
/// its state is still retired.
pub struct UploadHandle {
    task: TaskId,
    path: PathBuf,
    receiver: Receiver<UploadResult>,
}

impl UploadHandle {
    /// A handle fed by the returned sender instead of the registry.
    pub(crate) fn relay(task: TaskId, path: PathBuf) -> (Self, SyncSender<UploadResult>) {
        let (sender, receiver) = mpsc::sync_channel(1);
        (Self { task, path, receiver }, sender)
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the task completes.
    pub fn wait(self) -> UploadResult {
        self.receiver.recv().unwrap_or(Err(UploadError::Abandoned))
    }

    /// Block for at most `timeout`. `None` means still running.
    ///
    /// The result is delivered once; later calls after a `Some` report `Abandoned`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<UploadResult> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(UploadError::Abandoned)),
        }
    }
}

/// Runs many concurrent uploads over one shared transport.
///
/// ```text
/// upload(path) ─→ multipart body ─→ create_task (suspended)
///                                    ├→ register continuation / progress / body
///                                    └→ resume
/// transport ─→ TaskRegistry ─→ progress callback (by task id)
///                          └→ did_complete: retire all state, fulfil continuation once
/// ```
pub struct UploadMultiplexer {
    config: UploadConfiguration,
    transport: Arc<dyn Transport>,
    registry: Arc<TaskRegistry>,
}

impl UploadMultiplexer {
    pub fn new(config: UploadConfiguration, transport: Arc<dyn Transport>) -> Result<Self, UploadError> {
        config.validate()?;
        if config.is_plaintext_remote() {
            log::warn!(
                "Uploading recordings over plain HTTP to {}; consider https",
                config.endpoint
            );
        }

        let registry = Arc::new(TaskRegistry::new());
        transport.bind(registry.clone());
        Ok(Self {
            config,
            transport,
            registry,
        })
    }

    /// Multiplexer over an `HttpTransport` using the configured timeout.
    pub fn with_http_transport(config: UploadConfiguration) -> Result<Self, UploadError> {
        let transport = Arc::new(HttpTransport::new(config.timeout()));
        Self::new(config, transport)
    }

    pub fn config(&self) -> &UploadConfiguration {
        &self.config
    }

    /// Upload `path` and wait for the server's response.
    pub fn upload(&self, path: &Path, on_progress: impl Fn(f64) + Send + Sync + 'static) -> UploadResult {
        self.start_upload(path, on_progress)?.wait()
    }

    /// Start uploading `path` and return immediately.
    pub fn start_upload(
        &self,
        path: &Path,
        on_progress: impl Fn(f64) + Send + Sync + 'static,
    ) -> Result<UploadHandle, UploadError> {
        let callback: ProgressCallback = Arc::new(on_progress);
        self.start(path, move |_| callback)
    }

    /// Start uploading `path`, reporting progress to `delegate` under the task's id.
    pub fn start_upload_with_delegate(
        &self,
        path: &Path,
        delegate: Arc<dyn UploadDelegate>,
    ) -> Result<UploadHandle, UploadError> {
        let owned = path.to_path_buf();
        self.start(path, move |task| {
            let callback: ProgressCallback =
                Arc::new(move |fraction| delegate.on_upload_progress(task, &owned, fraction));
            callback
        })
    }

    pub fn tracked_tasks(&self) -> TrackedTasks {
        self.registry.tracked()
    }

    /// Last progress fraction of a running task.
    pub fn progress(&self, task: TaskId) -> Option<f64> {
        self.registry.progress(task)
    }

    fn start(
        &self,
        path: &Path,
        make_callback: impl FnOnce(TaskId) -> ProgressCallback,
    ) -> Result<UploadHandle, UploadError> {
        let body = multipart::recording_body(path)?;

        let mut headers = Vec::new();
        if let Some(ref token) = self.config.api_token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        let request = TransportRequest {
            url: self.config.endpoint.clone(),
            content_type: body.content_type(),
            headers,
            body: body.body,
            source: path.to_path_buf(),
        };

        let task = self.transport.create_task(request);
        let (continuation, receiver) = mpsc::sync_channel(1);
        self.registry.register(task, continuation, make_callback(task));
        self.transport.resume(task);

        log::debug!("Started {} for {}", task, path.display());
        Ok(UploadHandle {
            task,
            path: path.to_path_buf(),
            receiver,
        })
    }
}
