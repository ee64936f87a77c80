use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::audio_models::{AudioLevels, CaptureSessionDiagnostics};
use crate::models::error::CaptureError;
use crate::models::hal::AudioBuffer;
use crate::models::recording_result::RecordingResult;
use crate::models::state::RecordingState;
use crate::models::stream::StreamDescription;
use crate::models::target::CaptureTarget;
use crate::processing::stereo_mixer::{StereoMixer, MIX_OUTPUT_CHANNELS};
use crate::session::tap_manager::TapManager;
use crate::storage::wav_writer::{self, WavFileWriter};
use crate::traits::capture_delegate::CaptureDelegate;
use crate::traits::file_sink::FileSink;
use crate::traits::hal_gateway::{HalGateway, IoHandler};

/// Scratch space preallocated at start, in seconds of audio.
const SCRATCH_SECONDS: f64 = 0.1;

/// Level meter shared with the I/O thread. Values are stored as `f32` bits.
#[derive(Default)]
struct LevelMeter {
    primary: AtomicU32,
    secondary: AtomicU32,
    mix: AtomicU32,
    peak_primary: AtomicU32,
    peak_secondary: AtomicU32,
    peak_mix: AtomicU32,
}

impl LevelMeter {
    fn store(slot: &AtomicU32, value: f32) {
        slot.store(value.to_bits(), Ordering::Relaxed);
    }

    fn load(slot: &AtomicU32) -> f32 {
        f32::from_bits(slot.load(Ordering::Relaxed))
    }

    fn update(&self, primary: &[f32], secondary: &[f32], mix: &[f32]) {
        Self::store(&self.primary, StereoMixer::rms_level(primary));
        Self::store(&self.secondary, StereoMixer::rms_level(secondary));
        Self::store(&self.mix, StereoMixer::rms_level(mix));
        Self::store(&self.peak_primary, StereoMixer::peak_level(primary));
        Self::store(&self.peak_secondary, StereoMixer::peak_level(secondary));
        Self::store(&self.peak_mix, StereoMixer::peak_level(mix));
    }

    fn snapshot(&self) -> AudioLevels {
        AudioLevels {
            primary_level: Self::load(&self.primary),
            secondary_level: Self::load(&self.secondary),
            mix_level: Self::load(&self.mix),
            peak_primary_level: Self::load(&self.peak_primary),
            peak_secondary_level: Self::load(&self.peak_secondary),
            peak_mix_level: Self::load(&self.peak_mix),
        }
    }
}

#[derive(Default)]
struct IoCounters {
    callbacks: AtomicU64,
    short_deliveries: AtomicU64,
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    write_errors: AtomicU64,
}

/// State touched by every I/O cycle. Only contended while `stop()` takes the sink.
struct IoState<S> {
    sink: Option<S>,
    scratch: Vec<f32>,
}

/// Context registered as the aggregate device's I/O proc.
///
/// Owned by the session; the gateway drops its reference when the proc is destroyed.
struct IoContext<S: FileSink> {
    mixer: StereoMixer,
    io: Mutex<IoState<S>>,
    errors: SyncSender<CaptureError>,
    counters: IoCounters,
    levels: LevelMeter,
}

impl<S: FileSink> IoContext<S> {
    fn report_write_error(&self, frames: usize, error: CaptureError) {
        let count = self.counters.write_errors.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.frames_dropped.fetch_add(frames as u64, Ordering::Relaxed);
        // Log the 1st, 2nd, 4th, 8th... failure so a failing disk cannot flood the I/O thread.
        if count.is_power_of_two() {
            log::error!("Failed to write audio frames ({} failures so far): {}", count, error);
        }
        let _ = self.errors.try_send(error);
    }
}

impl<S: FileSink> IoHandler for IoContext<S> {
    fn process(&self, input: &[AudioBuffer<'_>]) {
        self.counters.callbacks.fetch_add(1, Ordering::Relaxed);

        let [primary, secondary, ..] = input else {
            self.counters.short_deliveries.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let frames = StereoMixer::usable_frames(primary, secondary);
        if frames == 0 {
            return;
        }

        let mut guard = self.io.lock();
        let IoState { sink, scratch } = &mut *guard;
        let Some(sink) = sink.as_mut() else {
            return;
        };

        let needed = frames * MIX_OUTPUT_CHANNELS as usize;
        if scratch.len() < needed {
            // HAL delivered more than announced; grow once.
            scratch.resize(needed, 0.0);
        }
        let mixed = self.mixer.mix_into(primary, secondary, &mut scratch[..needed]);
        let out = &scratch[..mixed * MIX_OUTPUT_CHANNELS as usize];

        self.levels.update(
            &primary.data[..frames * primary.channels as usize],
            &secondary.data[..frames * secondary.channels as usize],
            out,
        );

        match sink.write_frames(out) {
            Ok(()) => {
                self.counters.frames_written.fetch_add(mixed as u64, Ordering::Relaxed);
            }
            Err(e) => self.report_write_error(mixed, e),
        }
    }
}

/// One recording: binds an activated tap to a running I/O proc and streams
/// the mixed output to a file.
///
/// ```text
/// [tap group 0] ─┐
///                ├→ [StereoMixer] → [FileSink]   (on the HAL I/O thread)
/// [mic group 1] ─┘
/// ```
///
/// A session records once. `stop()` is idempotent and returns the same result
/// every time after the first.
pub struct CaptureSession<H: HalGateway, S: FileSink = WavFileWriter> {
    tap: Arc<TapManager<H>>,
    target: CaptureTarget,
    output_path: PathBuf,
    mixer: StereoMixer,
    state: RecordingState,
    format: Option<StreamDescription>,
    created_at: Option<String>,
    context: Option<Arc<IoContext<S>>>,
    errors: Option<Receiver<CaptureError>>,
    error_capacity: usize,
    result: Option<RecordingResult>,
    delegate: Option<Arc<dyn CaptureDelegate>>,
}

impl<H: HalGateway, S: FileSink> CaptureSession<H, S> {
    pub fn new(tap: Arc<TapManager<H>>, target: CaptureTarget, output_path: PathBuf) -> Self {
        Self {
            tap,
            target,
            output_path,
            mixer: StereoMixer::default(),
            state: RecordingState::Ready,
            format: None,
            created_at: None,
            context: None,
            errors: None,
            error_capacity: 32,
            result: None,
            delegate: None,
        }
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn CaptureDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn set_error_capacity(&mut self, capacity: usize) {
        self.error_capacity = capacity.max(1);
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_recording()
    }

    pub fn target(&self) -> &CaptureTarget {
        &self.target
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn levels(&self) -> AudioLevels {
        self.context
            .as_ref()
            .map(|c| c.levels.snapshot())
            .unwrap_or_default()
    }

    pub fn diagnostics(&self) -> CaptureSessionDiagnostics {
        let Some(context) = self.context.as_ref() else {
            return CaptureSessionDiagnostics::default();
        };
        let c = &context.counters;
        CaptureSessionDiagnostics {
            callback_count: c.callbacks.load(Ordering::Relaxed),
            short_deliveries: c.short_deliveries.load(Ordering::Relaxed),
            frames_written: c.frames_written.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            write_errors: c.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Advisory errors queued by the I/O thread since the last call.
    pub fn drain_errors(&self) -> Vec<CaptureError> {
        self.errors
            .as_ref()
            .map(|rx| rx.try_iter().collect())
            .unwrap_or_default()
    }

    /// Activate the tap if needed, open the file, and start the device.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        match self.state {
            RecordingState::Recording => return Err(CaptureError::AlreadyRunning),
            RecordingState::Stopped => return Err(CaptureError::SessionFinished),
            RecordingState::Ready => {}
        }

        if self.tap.state().is_idle() {
            self.tap.activate(&self.target)?;
        }
        match self.tap.target() {
            Some(tapped) if tapped.id != self.target.id => {
                return Err(CaptureError::ConfigurationFailed(format!(
                    "tap captures {} but the session records {}",
                    tapped.id, self.target.id
                )));
            }
            _ => {}
        }
        let negotiated = self.tap.stream_description().ok_or(CaptureError::NotActivated)?;
        negotiated.validate()?;

        let file_format = negotiated.with_channels(MIX_OUTPUT_CHANNELS);
        let sink = S::open(&self.output_path, &file_format)?;

        let scratch_frames = (negotiated.sample_rate * SCRATCH_SECONDS).ceil() as usize;
        let (errors_tx, errors_rx) = mpsc::sync_channel(self.error_capacity);
        let context = Arc::new(IoContext {
            mixer: self.mixer,
            io: Mutex::new(IoState {
                sink: Some(sink),
                scratch: vec![0.0; scratch_frames * MIX_OUTPUT_CHANNELS as usize],
            }),
            errors: errors_tx,
            counters: IoCounters::default(),
            levels: LevelMeter::default(),
        });

        if let Err(e) = self.tap.bind_io(context.clone()) {
            log::error!("Failed to register I/O proc: {}", e);
            Self::abandon_file(&context, &self.output_path);
            return Err(e);
        }
        if let Err(e) = self.tap.start_io() {
            log::error!("Failed to start aggregate device: {}", e);
            self.tap.unbind_io();
            Self::abandon_file(&context, &self.output_path);
            return Err(e);
        }

        log::info!(
            "Recording {} to {} ({} Hz, {} channels negotiated)",
            self.target.display_name,
            self.output_path.display(),
            negotiated.sample_rate,
            negotiated.channels
        );

        self.format = Some(file_format);
        self.created_at = Some(chrono::Utc::now().to_rfc3339());
        self.context = Some(context);
        self.errors = Some(errors_rx);
        self.state = RecordingState::Recording;

        if let Some(ref delegate) = self.delegate {
            delegate.on_recording_started(&self.output_path);
        }
        Ok(())
    }

    /// Stop the device, unregister the I/O proc, and finalize the file.
    pub fn stop(&mut self) -> Result<RecordingResult, CaptureError> {
        match self.state {
            RecordingState::Ready => return Err(CaptureError::NotStarted),
            RecordingState::Stopped => {
                return self.result.clone().ok_or(CaptureError::SessionFinished);
            }
            RecordingState::Recording => {}
        }

        // After this the I/O thread never touches the context again.
        if !self.tap.unbind_io() {
            log::warn!("I/O proc was already released (tap invalidated while recording)");
        }
        self.state = RecordingState::Stopped;

        let context = self.context.as_ref().ok_or(CaptureError::NotStarted)?;
        let sink = context.io.lock().sink.take();
        let mut sink = sink.ok_or_else(|| CaptureError::StorageError("file writer not available".into()))?;
        let summary = sink.close();

        for error in self.drain_errors() {
            if let Some(ref delegate) = self.delegate {
                delegate.on_error(&error);
            }
        }

        let summary = summary.map_err(|e| {
            log::error!("Failed to finalize {}: {}", self.output_path.display(), e);
            if let Some(ref delegate) = self.delegate {
                delegate.on_error(&e);
            }
            e
        })?;

        if summary.frames_lost > 0 {
            context
                .counters
                .frames_dropped
                .fetch_add(summary.frames_lost, Ordering::Relaxed);
            if let Some(ref delegate) = self.delegate {
                delegate.on_error(&CaptureError::StorageError(format!(
                    "{} buffered frames could not be written to {}",
                    summary.frames_lost,
                    self.output_path.display()
                )));
            }
        }

        let format = self.format.ok_or(CaptureError::NotStarted)?;
        let result = RecordingResult {
            id: uuid::Uuid::new_v4().to_string(),
            file_path: summary.path,
            target: self.target.clone(),
            format,
            frames_written: summary.frames_written,
            duration_secs: summary.frames_written as f64 / format.sample_rate,
            checksum: summary.checksum,
            created_at: self.created_at.clone().unwrap_or_default(),
        };

        let diagnostics = self.diagnostics();
        log::info!(
            "Recording finished: {} frames ({:.2}s), {} callbacks, {} short deliveries, {} write errors",
            result.frames_written,
            result.duration_secs,
            diagnostics.callback_count,
            diagnostics.short_deliveries,
            diagnostics.write_errors
        );

        self.result = Some(result.clone());
        if let Some(ref delegate) = self.delegate {
            delegate.on_recording_finished(&result);
        }
        Ok(result)
    }

    fn abandon_file(context: &IoContext<S>, path: &Path) {
        if let Some(mut sink) = context.io.lock().sink.take() {
            let _ = sink.close();
        }
        wav_writer::discard(path);
    }
}

impl<H: HalGateway, S: FileSink> Drop for CaptureSession<H, S> {
    fn drop(&mut self) {
        if self.state.is_recording() {
            if let Err(e) = self.stop() {
                log::error!("Failed to stop capture session on drop: {}", e);
            }
        }
    }
}
