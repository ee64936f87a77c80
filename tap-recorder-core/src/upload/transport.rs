use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::upload::TaskId;
use crate::traits::transport::{Transport, TransportDelegate, TransportError, TransportRequest};

const RESPONSE_CHUNK_BYTES: usize = 8 * 1024;

/// HTTP transport backed by one shared `ureq::Agent`.
///
/// The agent pools connections across tasks. Each resumed task runs on its
/// own named thread and reports to the bound delegate.
pub struct HttpTransport {
    agent: ureq::Agent,
    delegate: Mutex<Option<Arc<dyn TransportDelegate>>>,
    next_task: AtomicU64,
    suspended: Mutex<HashMap<TaskId, TransportRequest>>,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            delegate: Mutex::new(None),
            next_task: AtomicU64::new(1),
            suspended: Mutex::new(HashMap::new()),
        }
    }
}

impl Transport for HttpTransport {
    fn bind(&self, delegate: Arc<dyn TransportDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn create_task(&self, request: TransportRequest) -> TaskId {
        let task = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        self.suspended.lock().insert(task, request);
        task
    }

    fn resume(&self, task: TaskId) {
        let Some(request) = self.suspended.lock().remove(&task) else {
            log::warn!("Resume for unknown or already running {}", task);
            return;
        };
        let Some(delegate) = self.delegate.lock().clone() else {
            log::error!("No delegate bound; dropping {}", task);
            return;
        };

        let agent = self.agent.clone();
        let spawned = thread::Builder::new()
            .name(format!("upload-{}", task.0))
            .spawn({
                let delegate = Arc::clone(&delegate);
                move || run_task(agent, delegate, task, request)
            });

        if let Err(e) = spawned {
            delegate.did_complete(task, Err(TransportError(format!("failed to spawn upload thread: {}", e))));
        }
    }
}

/// Body reader that reports bytes handed to the socket.
struct ProgressReader {
    inner: Cursor<Vec<u8>>,
    sent: u64,
    total: u64,
    task: TaskId,
    delegate: Arc<dyn TransportDelegate>,
}

impl Read for ProgressReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sent += n as u64;
            self.delegate.did_send_body_data(self.task, self.sent, self.total);
        }
        Ok(n)
    }
}

fn run_task(agent: ureq::Agent, delegate: Arc<dyn TransportDelegate>, task: TaskId, request: TransportRequest) {
    let total = request.body.len() as u64;
    log::debug!("Uploading {} ({} bytes) as {}", request.source.display(), total, task);

    let mut call = agent
        .post(&request.url)
        .set("Content-Type", &request.content_type)
        .set("Content-Length", &total.to_string());
    for (name, value) in &request.headers {
        call = call.set(name, value);
    }

    let reader = ProgressReader {
        inner: Cursor::new(request.body),
        sent: 0,
        total,
        task,
        delegate: Arc::clone(&delegate),
    };

    let response = match call.send(reader) {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(ureq::Error::Transport(t)) => {
            log::warn!("{} failed: {}", task, t);
            delegate.did_complete(task, Err(TransportError(t.to_string())));
            return;
        }
    };

    let status = response.status();
    let mut body = response.into_reader();
    let mut chunk = vec![0u8; RESPONSE_CHUNK_BYTES];
    loop {
        match body.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => delegate.did_receive_data(task, &chunk[..n]),
            Err(e) => {
                delegate.did_complete(task, Err(TransportError(format!("failed to read response: {}", e))));
                return;
            }
        }
    }

    delegate.did_complete(task, Ok(status));
}
