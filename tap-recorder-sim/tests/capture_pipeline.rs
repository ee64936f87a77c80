use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tap_recorder_core::models::error::HalOperation;
use tap_recorder_core::processing::wav_format::{self, FORMAT_IEEE_FLOAT};
use tap_recorder_core::{
    CaptureConfiguration, CaptureDelegate, CaptureError, CaptureSession, CaptureTarget, FileSink, Recorder,
    RecordingResult, RecordingState, RecordingStorage, SinkSummary, StreamDescription, TapManager, TapState,
    TaskId, Transport, TransportDelegate, TransportRequest, UploadConfiguration, UploadDelegate, UploadError,
    UploadMultiplexer, UploadResponse, WavFileWriter,
};
use tap_recorder_sim::{Clock, ConstantSource, SimConfig, SimulatedHal, STATUS_BAD_OBJECT};

type Hal = Arc<SimulatedHal>;

struct Fixture {
    hal: Hal,
    tap: Arc<TapManager<Hal>>,
    config: CaptureConfiguration,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new(sim: SimConfig) -> Self {
        Self::with_capture(sim, |_| {})
    }

    fn with_capture(sim: SimConfig, adjust: impl FnOnce(&mut CaptureConfiguration)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CaptureConfiguration {
            output_directory: dir.path().to_path_buf(),
            ..CaptureConfiguration::default()
        };
        adjust(&mut config);
        let hal = Arc::new(SimulatedHal::new(sim));
        let tap = Arc::new(TapManager::new(Arc::clone(&hal), &config));
        Self { hal, tap, config, dir }
    }

    fn session(&self) -> CaptureSession<Hal> {
        CaptureSession::new(
            Arc::clone(&self.tap),
            CaptureTarget::system_wide(),
            self.config.next_recording_path(),
        )
    }

    fn assert_no_hal_objects(&self) {
        assert_eq!(self.hal.live_io_procs(), 0, "I/O procs left behind");
        assert_eq!(self.hal.live_aggregate_devices(), 0, "aggregate devices left behind");
        assert_eq!(self.hal.live_taps(), 0, "taps left behind");
    }
}

#[derive(Default)]
struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

impl CaptureDelegate for EventLog {
    fn on_tap_state_changed(&self, _target: &CaptureTarget, state: TapState) {
        self.0.lock().push(format!("tap:{:?}", state));
    }

    fn on_recording_started(&self, _path: &Path) {
        self.0.lock().push("started".into());
    }

    fn on_recording_finished(&self, result: &RecordingResult) {
        self.0.lock().push(format!("finished:{}", result.frames_written));
    }

    fn on_error(&self, error: &CaptureError) {
        self.0.lock().push(format!("error:{}", error));
    }
}

// -- Tap lifecycle --

#[test]
fn activate_then_invalidate_returns_to_baseline() {
    let f = Fixture::new(SimConfig::default());
    f.assert_no_hal_objects();

    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    assert_eq!(f.tap.state(), TapState::Activated);
    assert_eq!(f.hal.live_taps(), 1);
    assert_eq!(f.hal.live_aggregate_devices(), 1);

    f.tap.invalidate();
    assert_eq!(f.tap.state(), TapState::Invalidated);
    f.assert_no_hal_objects();
}

#[test]
fn activation_is_reentrant() {
    let f = Fixture::new(SimConfig::default());
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    assert_eq!(f.hal.live_taps(), 1);
    assert_eq!(f.hal.live_aggregate_devices(), 1);
}

#[test]
fn invalidate_twice_is_invalidate_once() {
    let f = Fixture::new(SimConfig::default());
    let events = Arc::new(EventLog::default());
    f.tap.set_delegate(events.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    f.tap.set_invalidation_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    f.tap.invalidate();
    f.tap.invalidate();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(events.events(), vec!["tap:Activated", "tap:Invalidated"]);
    f.assert_no_hal_objects();
}

#[test]
fn invalidated_tap_cannot_be_reactivated() {
    let f = Fixture::new(SimConfig::default());
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    f.tap.invalidate();
    assert_eq!(
        f.tap.activate(&CaptureTarget::system_wide()),
        Err(CaptureError::Invalidated)
    );
    f.assert_no_hal_objects();
}

#[test]
fn unknown_process_fails_without_aggregate() {
    let f = Fixture::new(SimConfig::default());
    let err = f
        .tap
        .activate(&CaptureTarget::process(424242, "Ghost"))
        .unwrap_err();

    assert!(matches!(err, CaptureError::Capability(_)));
    assert_eq!(err.status(), Some(STATUS_BAD_OBJECT));
    assert_eq!(f.tap.state(), TapState::Idle);
    f.assert_no_hal_objects();
}

#[test]
fn process_tap_filters_on_the_process() {
    let f = Fixture::new(SimConfig::default());
    let pid = f.hal.add_process("Music");
    f.tap.activate(&CaptureTarget::process(pid, "Music")).unwrap();

    let taps = f.hal.tap_descriptions();
    assert_eq!(taps.len(), 1);
    assert_eq!(
        taps[0].filter,
        tap_recorder_core::models::hal::TapFilter::Processes(vec![pid])
    );
}

#[test]
fn aggregate_layout_uses_output_as_clock() {
    let f = Fixture::new(SimConfig::default());
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();

    let aggregates = f.hal.aggregate_descriptions();
    let aggregate = &aggregates[0];
    let sim = f.hal.config();
    assert_eq!(aggregate.main_sub_device, "SimulatedOutputDevice");
    assert_eq!(aggregate.sub_devices.len(), 2);
    assert_eq!(aggregate.taps.len(), 1);
    assert!(aggregate.taps[0].drift_compensation);
    assert_eq!(Some(aggregate.taps[0].uid.clone()), f.tap.tap_uid());
    assert!(aggregate.is_private);
    assert!(!aggregate.is_stacked);
    assert!(aggregate.tap_auto_start);

    let negotiated = f.tap.negotiated_format().unwrap();
    assert!(negotiated.from_aggregate);
    assert_eq!(negotiated.description.sample_rate, sim.sample_rate);
}

#[test]
fn each_activation_gets_fresh_uids() {
    let f = Fixture::new(SimConfig::default());
    let g = Fixture::new(SimConfig::default());
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    g.tap.activate(&CaptureTarget::system_wide()).unwrap();
    assert_ne!(f.tap.tap_uid(), g.tap.tap_uid());
    assert_ne!(
        f.hal.aggregate_descriptions()[0].uid,
        g.hal.aggregate_descriptions()[0].uid
    );
}

#[test]
fn microphone_can_be_left_out_of_the_aggregate() {
    let f = Fixture::with_capture(
        SimConfig {
            has_input_device: false,
            ..SimConfig::default()
        },
        |c| c.include_microphone = false,
    );
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    assert_eq!(f.hal.aggregate_descriptions()[0].sub_devices.len(), 1);
}

#[test]
fn failing_activation_steps_roll_back() {
    let steps = [
        HalOperation::ReadDefaultOutputDevice,
        HalOperation::ReadDefaultInputDevice,
        HalOperation::CreateAggregateDevice,
    ];
    for operation in steps {
        let f = Fixture::new(SimConfig::default());
        f.hal.fail_next(operation, -10851);

        let err = f.tap.activate(&CaptureTarget::system_wide()).unwrap_err();
        assert_eq!(err.status(), Some(-10851), "{:?}", operation);
        assert_eq!(f.tap.state(), TapState::Idle);
        f.assert_no_hal_objects();

        // The manager is still usable after a rollback.
        f.tap.activate(&CaptureTarget::system_wide()).unwrap();
        assert_eq!(f.tap.state(), TapState::Activated);
    }
}

#[test]
fn failing_tap_creation_creates_nothing() {
    let f = Fixture::new(SimConfig::default());
    f.hal.fail_next(HalOperation::CreateTap, -50);
    assert_eq!(
        f.tap.activate(&CaptureTarget::system_wide()).unwrap_err().status(),
        Some(-50)
    );
    f.assert_no_hal_objects();
}

#[test]
fn invalid_format_rolls_back() {
    let f = Fixture::new(SimConfig::default());
    f.hal.set_format_override(StreamDescription::interleaved(0.0, 2));

    let err = f.tap.activate(&CaptureTarget::system_wide()).unwrap_err();
    assert!(matches!(err, CaptureError::InvalidFormat(_)));
    assert_eq!(f.tap.state(), TapState::Idle);
    f.assert_no_hal_objects();
}

#[test]
fn unreadable_aggregate_format_falls_back_to_tap() {
    let f = Fixture::new(SimConfig {
        aggregate_format_readable: false,
        tap_channels: 6,
        ..SimConfig::default()
    });
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();

    let negotiated = f.tap.negotiated_format().unwrap();
    assert!(!negotiated.from_aggregate);
    assert_eq!(negotiated.description.channels, 6);
}

#[test]
fn destroy_failures_are_tolerated() {
    let f = Fixture::new(SimConfig::default());
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    f.hal.fail_next(HalOperation::DestroyAggregateDevice, -1);

    f.tap.invalidate();
    assert_eq!(f.tap.state(), TapState::Invalidated);
    // The aggregate leaked, so its tap could not be destroyed either.
    assert_eq!(f.hal.live_aggregate_devices(), 1);
    assert_eq!(f.hal.live_taps(), 1);
}

// -- Capture session --

#[test]
fn ten_sine_cycles_write_exactly_4800_frames() {
    let f = Fixture::new(SimConfig::default());
    let mut session = f.session();
    session.start().unwrap();

    assert_eq!(f.hal.pump(10), 10);
    let result = session.stop().unwrap();

    assert_eq!(result.frames_written, 4800);
    approx::assert_abs_diff_eq!(result.duration_secs, 0.1, epsilon = 1e-9);

    let (info, samples) = wav_format::read_wav_f32(&result.file_path).unwrap();
    assert_eq!(info.format_code, FORMAT_IEEE_FLOAT);
    assert_eq!(info.channels, 2);
    assert_eq!(info.sample_rate, 48000);
    assert_eq!(info.frame_count(), 4800);
    assert_eq!(samples.len(), 9600);
    assert!(samples.iter().all(|s| (-1.5..=1.5).contains(s)));
    assert!(samples.iter().any(|s| s.abs() > 0.1), "signal should not be silent");

    assert_eq!(
        result.checksum,
        tap_recorder_core::storage::wav_writer::sha256_file(&result.file_path).unwrap()
    );
}

#[test]
fn constant_inputs_mix_to_primary_plus_half_secondary() {
    let f = Fixture::new(SimConfig::default());
    f.hal.set_source(ConstantSource::new(0.2, 0.4));

    let mut session = f.session();
    session.start().unwrap();
    f.hal.pump(3);
    let result = session.stop().unwrap();

    let (_, samples) = wav_format::read_wav_f32(&result.file_path).unwrap();
    assert_eq!(samples.len(), 3 * 480 * 2);
    for sample in samples {
        approx::assert_abs_diff_eq!(sample, 0.4, epsilon = 1e-6);
    }
}

#[test]
fn mixed_output_is_not_clamped() {
    let f = Fixture::new(SimConfig::default());
    f.hal.set_source(ConstantSource::new(0.9, 0.8));

    let mut session = f.session();
    session.start().unwrap();
    f.hal.pump(1);
    let levels = session.levels();
    let result = session.stop().unwrap();

    let (_, samples) = wav_format::read_wav_f32(&result.file_path).unwrap();
    approx::assert_abs_diff_eq!(samples[0], 1.3, epsilon = 1e-6);
    approx::assert_abs_diff_eq!(levels.peak_mix_level, 1.3, epsilon = 1e-6);
    approx::assert_abs_diff_eq!(levels.primary_level, 0.9, epsilon = 1e-6);
}

#[test]
fn unequal_groups_write_the_shorter_length() {
    let f = Fixture::new(SimConfig {
        input_frames_per_buffer: Some(300),
        ..SimConfig::default()
    });
    let mut session = f.session();
    session.start().unwrap();
    f.hal.pump(10);
    let result = session.stop().unwrap();
    assert_eq!(result.frames_written, 3000);
}

#[test]
fn single_group_deliveries_are_skipped() {
    let f = Fixture::with_capture(SimConfig::default(), |c| c.include_microphone = false);
    let mut session = f.session();
    session.start().unwrap();
    f.hal.pump(10);

    let diagnostics = session.diagnostics();
    assert_eq!(diagnostics.callback_count, 10);
    assert_eq!(diagnostics.short_deliveries, 10);

    let result = session.stop().unwrap();
    assert_eq!(result.frames_written, 0);
    let (info, _) = wav_format::read_wav_f32(&result.file_path).unwrap();
    assert_eq!(info.data_size, 0);
}

#[test]
fn session_auto_activates_an_idle_tap() {
    let f = Fixture::new(SimConfig::default());
    assert_eq!(f.tap.state(), TapState::Idle);
    let mut session = f.session();
    session.start().unwrap();
    assert_eq!(f.tap.state(), TapState::Activated);
    assert!(f.tap.is_io_running());
    assert_eq!(f.hal.running_devices(), 1);
}

#[test]
fn session_rejects_a_tap_activated_for_another_target() {
    let f = Fixture::new(SimConfig::default());
    let pid = f.hal.add_process("Player");
    f.tap.activate(&CaptureTarget::process(pid, "Player")).unwrap();

    let mut session = f.session();
    assert!(matches!(
        session.start(),
        Err(CaptureError::ConfigurationFailed(_))
    ));
    assert_eq!(session.state(), RecordingState::Ready);
    assert_eq!(f.hal.live_io_procs(), 0);
    assert_eq!(std::fs::read_dir(f.dir.path()).unwrap().count(), 0);

    // The tap keeps serving its own target.
    let mut matching: CaptureSession<Hal> = CaptureSession::new(
        Arc::clone(&f.tap),
        CaptureTarget::process(pid, "Player"),
        f.config.next_recording_path(),
    );
    matching.start().unwrap();
    f.hal.pump(1);
    let result = matching.stop().unwrap();
    assert_eq!(result.target.id, CaptureTarget::process(pid, "Player").id);
    assert_eq!(result.frames_written, 480);
}

#[test]
fn stop_is_idempotent_and_releases_io() {
    let f = Fixture::new(SimConfig::default());
    let mut session = f.session();
    assert_eq!(session.stop().unwrap_err(), CaptureError::NotStarted);

    session.start().unwrap();
    assert_eq!(session.start().unwrap_err(), CaptureError::AlreadyRunning);
    f.hal.pump(2);

    let first = session.stop().unwrap();
    assert_eq!(f.hal.live_io_procs(), 0);
    assert_eq!(f.hal.running_devices(), 0);

    let second = session.stop().unwrap();
    assert_eq!(first, second);
    assert_eq!(session.state(), RecordingState::Stopped);
    assert_eq!(session.start().unwrap_err(), CaptureError::SessionFinished);

    // Tap outlives the session until invalidated.
    assert_eq!(f.hal.live_aggregate_devices(), 1);
    f.tap.invalidate();
    f.assert_no_hal_objects();
}

#[test]
fn delegate_sees_each_transition_once() {
    let f = Fixture::new(SimConfig::default());
    let events = Arc::new(EventLog::default());
    f.tap.set_delegate(events.clone());

    let mut session = f.session();
    session.set_delegate(events.clone());
    session.start().unwrap();
    f.hal.pump(1);
    session.stop().unwrap();
    session.stop().unwrap();
    f.tap.invalidate();

    assert_eq!(
        events.events(),
        vec!["tap:Activated", "started", "finished:480", "tap:Invalidated"]
    );
}

#[test]
fn start_failure_removes_the_partial_file() {
    let f = Fixture::new(SimConfig::default());
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    f.hal.fail_next(HalOperation::StartDevice, -66);

    let mut session = f.session();
    let err = session.start().unwrap_err();
    assert_eq!(err.status(), Some(-66));
    assert!(!session.output_path().exists());
    assert_eq!(f.hal.live_io_procs(), 0);
    assert_eq!(session.state(), RecordingState::Ready);
    assert_eq!(f.tap.state(), TapState::Activated);
}

#[test]
fn io_proc_failure_removes_the_partial_file() {
    let f = Fixture::new(SimConfig::default());
    f.tap.activate(&CaptureTarget::system_wide()).unwrap();
    f.hal.fail_next(HalOperation::CreateIoProc, -4);

    let mut session = f.session();
    assert_eq!(session.start().unwrap_err().status(), Some(-4));
    assert!(!session.output_path().exists());
}

#[test]
fn destination_is_write_once() {
    let f = Fixture::new(SimConfig::default());
    let path = f.dir.path().join("taken.wav");
    std::fs::write(&path, b"existing").unwrap();

    let mut session: CaptureSession<Hal> =
        CaptureSession::new(Arc::clone(&f.tap), CaptureTarget::system_wide(), path.clone());
    assert!(matches!(session.start(), Err(CaptureError::StorageError(_))));
    assert_eq!(std::fs::read(&path).unwrap(), b"existing");
    assert_eq!(f.hal.live_io_procs(), 0);
}

#[test]
fn invalidating_mid_recording_stops_delivery() {
    let f = Fixture::new(SimConfig::default());
    let mut session = f.session();
    session.start().unwrap();
    f.hal.pump(2);

    f.tap.invalidate();
    f.assert_no_hal_objects();
    assert_eq!(f.hal.pump(5), 0);

    let result = session.stop().unwrap();
    assert_eq!(result.frames_written, 960);
}

/// Sink that fails the second and third write.
struct FailingSink {
    path: PathBuf,
    writes: usize,
    frames: u64,
}

impl FileSink for FailingSink {
    fn open(path: &Path, format: &StreamDescription) -> Result<Self, CaptureError> {
        assert_eq!(format.channels, 2);
        Ok(Self {
            path: path.to_path_buf(),
            writes: 0,
            frames: 0,
        })
    }

    fn write_frames(&mut self, samples: &[f32]) -> Result<(), CaptureError> {
        self.writes += 1;
        if self.writes == 2 || self.writes == 3 {
            return Err(CaptureError::StorageError("disk full".into()));
        }
        self.frames += samples.len() as u64 / 2;
        Ok(())
    }

    fn close(&mut self) -> Result<SinkSummary, CaptureError> {
        Ok(SinkSummary {
            path: self.path.clone(),
            frames_written: self.frames,
            frames_lost: 0,
            checksum: String::new(),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[test]
fn write_errors_are_advisory() {
    let f = Fixture::new(SimConfig::default());
    let mut session: CaptureSession<Hal, FailingSink> = CaptureSession::new(
        Arc::clone(&f.tap),
        CaptureTarget::system_wide(),
        f.config.next_recording_path(),
    );
    session.start().unwrap();
    f.hal.pump(10);

    assert!(session.is_running());
    let diagnostics = session.diagnostics();
    assert_eq!(diagnostics.write_errors, 2);
    assert_eq!(diagnostics.frames_written, 8 * 480);
    assert_eq!(diagnostics.frames_dropped, 2 * 480);

    let errors = session.drain_errors();
    assert_eq!(errors, vec![CaptureError::StorageError("disk full".into()); 2]);
    assert!(session.drain_errors().is_empty());

    let result = session.stop().unwrap();
    assert_eq!(result.frames_written, 8 * 480);
}

#[test]
fn advisory_queue_is_bounded() {
    let f = Fixture::new(SimConfig::default());
    let mut session: CaptureSession<Hal, FailingSink> = CaptureSession::new(
        Arc::clone(&f.tap),
        CaptureTarget::system_wide(),
        f.config.next_recording_path(),
    );
    session.set_error_capacity(1);
    session.start().unwrap();
    f.hal.pump(4);

    assert_eq!(session.diagnostics().write_errors, 2);
    assert_eq!(session.drain_errors().len(), 1);
}

/// Bytes the capped sink may write after the header. Not a whole number of frames.
const CAPPED_DATA_BYTES: u64 = 100_003;

/// File that cannot grow past a fixed size, like a volume running out of space.
struct CappedFile {
    file: File,
    limit: u64,
}

impl Write for CappedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let position = self.file.stream_position()?;
        let room = self.limit.saturating_sub(position) as usize;
        if room == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
        }
        self.file.write(&buf[..buf.len().min(room)])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for CappedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl RecordingStorage for CappedFile {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// The production WAV writer on top of a `CappedFile`.
struct CappedWavSink(WavFileWriter);

impl FileSink for CappedWavSink {
    fn open(path: &Path, format: &StreamDescription) -> Result<Self, CaptureError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| CaptureError::StorageError(e.to_string()))?;
        let storage = CappedFile {
            file,
            limit: wav_format::WAV_HEADER_SIZE as u64 + CAPPED_DATA_BYTES,
        };
        WavFileWriter::with_storage(path, Box::new(storage), format).map(Self)
    }

    fn write_frames(&mut self, samples: &[f32]) -> Result<(), CaptureError> {
        self.0.write_frames(samples)
    }

    fn close(&mut self) -> Result<SinkSummary, CaptureError> {
        self.0.close()
    }

    fn path(&self) -> &Path {
        self.0.path()
    }
}

#[test]
fn running_out_of_space_keeps_a_readable_file() {
    let f = Fixture::new(SimConfig::default());
    f.hal.set_source(ConstantSource::new(0.2, 0.4));
    let events = Arc::new(EventLog::default());

    let mut session: CaptureSession<Hal, CappedWavSink> = CaptureSession::new(
        Arc::clone(&f.tap),
        CaptureTarget::system_wide(),
        f.config.next_recording_path(),
    );
    session.set_delegate(events.clone());
    session.start().unwrap();
    f.hal.pump(60);
    assert!(session.is_running());
    assert!(session.diagnostics().write_errors > 0);

    let result = session.stop().unwrap();
    let whole_frames = CAPPED_DATA_BYTES / 8;
    assert_eq!(result.frames_written, whole_frames);

    let diagnostics = session.diagnostics();
    assert_eq!(result.frames_written + diagnostics.frames_dropped, 60 * 480);

    assert_eq!(
        std::fs::metadata(&result.file_path).unwrap().len(),
        44 + whole_frames * 8
    );
    let (info, samples) = wav_format::read_wav_f32(&result.file_path).unwrap();
    assert_eq!(info.frame_count(), whole_frames);
    assert_eq!(samples.len() as u64, whole_frames * 2);
    for sample in samples {
        approx::assert_abs_diff_eq!(sample, 0.4, epsilon = 1e-6);
    }
    assert_eq!(
        result.checksum,
        tap_recorder_core::storage::wav_writer::sha256_file(&result.file_path).unwrap()
    );
    assert!(events.count("error:") >= 1);
    assert_eq!(events.count("finished:"), 1);
}

#[test]
fn real_time_clock_records_until_stopped() {
    let f = Fixture::new(SimConfig {
        frames_per_buffer: 96,
        clock: Clock::RealTime,
        ..SimConfig::default()
    });
    let mut session = f.session();
    session.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.diagnostics().callback_count < 10 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }

    let result = session.stop().unwrap();
    assert!(result.frames_written >= 960);
    assert_eq!(result.frames_written % 96, 0);

    let (info, samples) = wav_format::read_wav_f32(&result.file_path).unwrap();
    assert_eq!(info.frame_count(), result.frames_written);
    assert_eq!(samples.len() as u64, result.frames_written * 2);
}

// -- Recorder service --

/// Transport answering every task with the uploaded file's name.
#[derive(Default)]
struct EchoTransport {
    delegate: Mutex<Option<Arc<dyn TransportDelegate>>>,
    next: AtomicU64,
    suspended: Mutex<HashMap<TaskId, TransportRequest>>,
}

impl Transport for EchoTransport {
    fn bind(&self, delegate: Arc<dyn TransportDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    fn create_task(&self, request: TransportRequest) -> TaskId {
        let task = TaskId(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.suspended.lock().insert(task, request);
        task
    }

    fn resume(&self, task: TaskId) {
        let request = self.suspended.lock().remove(&task).unwrap();
        let delegate = self.delegate.lock().clone().unwrap();
        std::thread::spawn(move || {
            let total = request.body.len() as u64;
            delegate.did_send_body_data(task, total, 2 * total);
            delegate.did_send_body_data(task, 2 * total, 2 * total);
            let name = request.source.file_name().unwrap().to_string_lossy().into_owned();
            let body = format!(r#"{{"data":{{"upload_url":"https://files.example/{}"}}}}"#, name);
            delegate.did_receive_data(task, body.as_bytes());
            delegate.did_complete(task, Ok(200));
        });
    }
}

type UploadEvent = (TaskId, PathBuf, Result<UploadResponse, UploadError>);

struct UploadLog {
    progress: Mutex<Vec<f64>>,
    finished: Mutex<mpsc::Sender<UploadEvent>>,
}

impl UploadDelegate for UploadLog {
    fn on_upload_progress(&self, _task: TaskId, _path: &Path, fraction: f64) {
        self.progress.lock().push(fraction);
    }

    fn on_upload_finished(&self, task: TaskId, path: &Path, result: &Result<UploadResponse, UploadError>) {
        let _ = self
            .finished
            .lock()
            .send((task, path.to_path_buf(), result.clone()));
    }
}

#[test]
fn recorder_records_and_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let hal = Arc::new(SimulatedHal::new(SimConfig::default()));
    let pid = hal.add_process("Meeting");

    let transport = Arc::new(EchoTransport::default());
    let uploader = Arc::new(
        UploadMultiplexer::new(UploadConfiguration::new("https://uploads.example/v1"), transport).unwrap(),
    );
    let config = CaptureConfiguration {
        output_directory: dir.path().to_path_buf(),
        file_prefix: "meeting".into(),
        ..CaptureConfiguration::default()
    };
    let recorder: Recorder<SimulatedHal> = Recorder::new(Arc::clone(&hal), config)
        .unwrap()
        .with_uploader(Arc::clone(&uploader));

    let events = Arc::new(EventLog::default());
    let (tx, rx) = mpsc::channel();
    let uploads = Arc::new(UploadLog {
        progress: Mutex::new(Vec::new()),
        finished: Mutex::new(tx),
    });
    recorder.set_delegate(events.clone());
    recorder.set_upload_delegate(uploads.clone());

    let path = recorder
        .start_recording(CaptureTarget::process(pid, "Meeting"))
        .unwrap();
    assert!(recorder.is_recording());
    assert_eq!(recorder.current_path(), Some(path.clone()));
    assert_eq!(
        recorder.start_recording(CaptureTarget::system_wide()),
        Err(CaptureError::AlreadyRunning)
    );

    hal.pump(5);
    let result = recorder.stop_recording().unwrap();
    assert_eq!(result.file_path, path);
    assert_eq!(result.frames_written, 2400);
    assert!(result.file_name().starts_with("meeting_"));
    assert!(!recorder.is_recording());

    // Tap and aggregate are torn down with the recording.
    assert_eq!(hal.live_taps(), 0);
    assert_eq!(hal.live_aggregate_devices(), 0);

    let (_, uploaded_path, outcome) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(uploaded_path, path);
    assert_eq!(
        outcome.unwrap().upload_url(),
        format!("https://files.example/{}", result.file_name())
    );
    assert_eq!(*uploads.progress.lock(), vec![0.5, 1.0]);
    assert_eq!(events.count("tap:"), 2);
    assert_eq!(events.count("finished:"), 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while !uploader.tracked_tasks().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(uploader.tracked_tasks().is_empty());

    assert_eq!(recorder.stop_recording().unwrap_err(), CaptureError::NotStarted);
}

#[test]
fn recorder_can_record_again_with_a_fresh_tap() {
    let dir = tempfile::tempdir().unwrap();
    let hal = Arc::new(SimulatedHal::new(SimConfig::default()));
    let config = CaptureConfiguration {
        output_directory: dir.path().to_path_buf(),
        ..CaptureConfiguration::default()
    };
    let recorder: Recorder<SimulatedHal> = Recorder::new(Arc::clone(&hal), config).unwrap();

    let first = recorder.start_recording(CaptureTarget::system_wide()).unwrap();
    hal.pump(1);
    recorder.stop_recording().unwrap();

    let second = recorder.start_recording(CaptureTarget::system_wide()).unwrap();
    assert_ne!(first, second);
    hal.pump(2);
    assert_eq!(recorder.stop_recording().unwrap().frames_written, 960);
    assert_eq!(hal.live_taps(), 0);
}

#[test]
fn recorder_rejects_bad_configuration() {
    let hal = Arc::new(SimulatedHal::new(SimConfig::default()));
    let config = CaptureConfiguration {
        file_prefix: "a/b".into(),
        ..CaptureConfiguration::default()
    };
    let result: Result<Recorder<SimulatedHal>, _> = Recorder::new(hal, config);
    assert!(matches!(result, Err(CaptureError::ConfigurationFailed(_))));
}

#[test]
fn recorder_cleans_up_after_failed_start() {
    let dir = tempfile::tempdir().unwrap();
    let hal = Arc::new(SimulatedHal::new(SimConfig::default()));
    let config = CaptureConfiguration {
        output_directory: dir.path().to_path_buf(),
        ..CaptureConfiguration::default()
    };
    let recorder: Recorder<SimulatedHal> = Recorder::new(Arc::clone(&hal), config).unwrap();

    hal.fail_next(HalOperation::StartDevice, -1);
    assert!(recorder.start_recording(CaptureTarget::system_wide()).is_err());
    assert!(!recorder.is_recording());
    assert_eq!(hal.live_io_procs(), 0);
    assert_eq!(hal.live_aggregate_devices(), 0);
    assert_eq!(hal.live_taps(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

/// Reads recorder state from inside its notifications.
#[derive(Default)]
struct RecorderObserver {
    recorder: Mutex<Weak<Recorder<SimulatedHal>>>,
    seen: Mutex<Vec<(String, bool, Option<PathBuf>)>>,
}

impl RecorderObserver {
    fn observe(&self, event: &str) {
        let recorder = self.recorder.lock().upgrade();
        if let Some(recorder) = recorder {
            let snapshot = (event.to_string(), recorder.is_recording(), recorder.current_path());
            let _ = recorder.levels();
            self.seen.lock().push(snapshot);
        }
    }
}

impl CaptureDelegate for RecorderObserver {
    fn on_tap_state_changed(&self, _target: &CaptureTarget, state: TapState) {
        self.observe(&format!("tap:{:?}", state));
    }

    fn on_recording_started(&self, _path: &Path) {
        self.observe("started");
    }

    fn on_recording_finished(&self, _result: &RecordingResult) {
        self.observe("finished");
    }

    fn on_error(&self, _error: &CaptureError) {}
}

#[test]
fn delegate_can_query_the_recorder_from_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let hal = Arc::new(SimulatedHal::new(SimConfig::default()));
    let config = CaptureConfiguration {
        output_directory: dir.path().to_path_buf(),
        ..CaptureConfiguration::default()
    };
    let recorder: Arc<Recorder<SimulatedHal>> = Arc::new(Recorder::new(Arc::clone(&hal), config).unwrap());
    let observer = Arc::new(RecorderObserver::default());
    *observer.recorder.lock() = Arc::downgrade(&recorder);
    recorder.set_delegate(observer.clone());

    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(&recorder);
    std::thread::spawn(move || {
        let started = worker.start_recording(CaptureTarget::system_wide());
        let _ = tx.send(started);
    });
    let path = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("start_recording blocked on its own delegate")
        .unwrap();

    assert!(recorder.is_recording());
    hal.pump(2);
    let result = recorder.stop_recording().unwrap();
    assert_eq!(result.frames_written, 960);

    let seen = observer.seen.lock().clone();
    let names: Vec<&str> = seen.iter().map(|(name, _, _)| name.as_str()).collect();
    assert_eq!(names, vec!["tap:Activated", "started", "finished", "tap:Invalidated"]);
    // The recording is installed only after start returns, and is gone before stop notifies.
    assert!(seen.iter().all(|(_, recording, current)| !recording && current.is_none()));
    assert_eq!(path, result.file_path);
}
