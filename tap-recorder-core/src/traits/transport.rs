use std::path::PathBuf;
use std::sync::Arc;

use crate::models::upload::TaskId;

/// A fully built HTTP request handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub url: String,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Recording the body was built from, for logging.
    pub source: PathBuf,
}

/// Transport-level failure (no HTTP status was received).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback surface the transport reports every task's events to.
///
/// One delegate serves all tasks; the task id is the only way to tell them apart.
pub trait TransportDelegate: Send + Sync {
    fn did_send_body_data(&self, task: TaskId, total_bytes_sent: u64, total_bytes_expected: u64);

    fn did_receive_data(&self, task: TaskId, data: &[u8]);

    /// Final callback for a task. `Ok` carries the HTTP status code.
    fn did_complete(&self, task: TaskId, outcome: Result<u16, TransportError>);
}

/// Shared network session running many transfers concurrently.
///
/// Tasks are created suspended so the caller can register per-task state
/// before any delegate callback for that id can fire.
pub trait Transport: Send + Sync {
    /// Attach the delegate that receives every task's callbacks.
    fn bind(&self, delegate: Arc<dyn TransportDelegate>);

    /// Create a suspended task. Ids are unique for the transport's lifetime.
    fn create_task(&self, request: TransportRequest) -> TaskId;

    /// Start a task created by `create_task`.
    fn resume(&self, task: TaskId);
}
