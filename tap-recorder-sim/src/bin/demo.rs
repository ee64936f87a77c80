//! Record a few seconds from the simulated HAL and optionally upload the file.
//!
//! ```text
//! tap-recorder-demo [OUTPUT_DIR] [SECONDS] [UPLOAD_CONFIG_JSON]
//! ```

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use tap_recorder_core::{
    CaptureConfiguration, CaptureDelegate, CaptureError, CaptureTarget, Recorder, RecordingResult, TapState,
    TaskId, UploadConfiguration, UploadDelegate, UploadError, UploadMultiplexer, UploadResponse,
};
use tap_recorder_sim::{Clock, SimConfig, SimulatedHal};

/// Prints delegate events as JSON lines.
struct ConsoleDelegate {
    finished: Mutex<Option<mpsc::Sender<()>>>,
}

impl CaptureDelegate for ConsoleDelegate {
    fn on_tap_state_changed(&self, target: &CaptureTarget, state: TapState) {
        println!(
            "{}",
            serde_json::json!({ "event": "tap", "target": target.display_name, "state": format!("{:?}", state) })
        );
    }

    fn on_recording_started(&self, path: &Path) {
        println!("{}", serde_json::json!({ "event": "started", "path": path }));
    }

    fn on_recording_finished(&self, result: &RecordingResult) {
        println!(
            "{}",
            serde_json::json!({ "event": "finished", "recording": result })
        );
    }

    fn on_error(&self, error: &CaptureError) {
        println!("{}", serde_json::json!({ "event": "error", "message": error.to_string() }));
    }
}

impl UploadDelegate for ConsoleDelegate {
    fn on_upload_progress(&self, task: TaskId, _path: &Path, fraction: f64) {
        println!(
            "{}",
            serde_json::json!({ "event": "upload-progress", "task": task.0, "fraction": fraction })
        );
    }

    fn on_upload_finished(&self, task: TaskId, path: &Path, result: &Result<UploadResponse, UploadError>) {
        let line = match result {
            Ok(response) => serde_json::json!({
                "event": "uploaded", "task": task.0, "path": path, "url": response.upload_url()
            }),
            Err(e) => serde_json::json!({
                "event": "upload-failed", "task": task.0, "path": path, "message": e.to_string()
            }),
        };
        println!("{}", line);
        if let Some(done) = self.finished.lock().take() {
            let _ = done.send(());
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let output_directory = args.next().map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
    let seconds: f64 = args.next().map(|s| s.parse::<f64>()).transpose()?.unwrap_or(2.0);
    let upload_config = args.next().map(PathBuf::from);

    let hal = Arc::new(SimulatedHal::new(SimConfig {
        clock: Clock::RealTime,
        ..SimConfig::default()
    }));
    let player = hal.add_process("Simulated Player");

    let config = CaptureConfiguration {
        output_directory,
        ..CaptureConfiguration::default()
    };
    let mut recorder: Recorder<SimulatedHal> = Recorder::new(Arc::clone(&hal), config)?;

    let (done_tx, done_rx) = mpsc::channel();
    let has_uploader = match upload_config {
        Some(path) => {
            let upload = UploadConfiguration::from_json_file(&path)?;
            recorder = recorder.with_uploader(Arc::new(UploadMultiplexer::with_http_transport(upload)?));
            true
        }
        None => false,
    };

    let delegate = Arc::new(ConsoleDelegate {
        finished: Mutex::new(Some(done_tx)),
    });
    recorder.set_delegate(delegate.clone());
    recorder.set_upload_delegate(delegate);

    recorder.start_recording(CaptureTarget::process(player, "Simulated Player"))?;
    thread::sleep(Duration::from_secs_f64(seconds));
    let result = recorder.stop_recording()?;

    log::info!(
        "Wrote {} ({} frames, sha256 {})",
        result.file_path.display(),
        result.frames_written,
        result.checksum
    );

    if has_uploader && done_rx.recv_timeout(Duration::from_secs(120)).is_err() {
        log::warn!("Upload did not finish in time");
    }
    Ok(())
}
