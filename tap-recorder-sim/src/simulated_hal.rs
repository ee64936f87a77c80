//! In-process audio HAL.
//!
//! Models the object graph of a process-tap capable HAL: taps, private
//! aggregate devices built from them, and I/O procs registered on those
//! devices. Buffers are delivered either on demand (`pump`) or from a
//! dedicated I/O thread pacing itself to the configured buffer period.
//!
//! ## Differences from a hardware HAL
//! - Object ids are allocated sequentially and never reused
//! - Destroying a tap still referenced by an aggregate device fails
//! - Destroying a device with a registered I/O proc fails
//! - Failures can be injected per operation with `fail_next`

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use tap_recorder_core::models::error::{HalError, HalOperation};
use tap_recorder_core::models::hal::{
    AggregateDeviceDescription, AggregateDeviceHandle, AudioBuffer, DeviceInfo, HalObject, IoProcId, ObjectId,
    Scope, TapDescription, TapFilter, TapHandle,
};
use tap_recorder_core::models::stream::StreamDescription;
use tap_recorder_core::traits::hal_gateway::{HalGateway, IoHandler};

use crate::io_thread::IoThread;
use crate::signal::{SignalSource, SineSource};

const fn fourcc(code: &[u8; 4]) -> i32 {
    i32::from_be_bytes(*code)
}

/// `'!obj'`: the object id does not name a live object.
pub const STATUS_BAD_OBJECT: i32 = fourcc(b"!obj");
/// `'who?'`: the object has no such property in that scope.
pub const STATUS_UNKNOWN_PROPERTY: i32 = fourcc(b"who?");
/// `'nope'`: the operation is not allowed in the object's current state.
pub const STATUS_ILLEGAL_OPERATION: i32 = fourcc(b"nope");

/// How buffers reach registered I/O procs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    /// Only `SimulatedHal::pump` delivers buffers.
    Manual,
    /// A named I/O thread delivers one cycle per buffer period while any device runs.
    RealTime,
}

/// Device layout of the simulated machine.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub sample_rate: f64,
    /// Channels of a non-mono tap.
    pub tap_channels: u32,
    /// Channels of the default input device.
    pub input_channels: u32,
    /// Channels of the default output device, reported as the aggregate's output format.
    pub output_channels: u32,
    pub frames_per_buffer: usize,
    /// Frames per cycle on the input group; defaults to `frames_per_buffer`.
    pub input_frames_per_buffer: Option<usize>,
    pub has_input_device: bool,
    /// When false, output-scope reads on aggregate devices fail and the tap format is used.
    pub aggregate_format_readable: bool,
    pub clock: Clock,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000.0,
            tap_channels: 2,
            input_channels: 1,
            output_channels: 2,
            frames_per_buffer: 480,
            input_frames_per_buffer: None,
            has_input_device: true,
            aggregate_format_readable: true,
            clock: Clock::Manual,
        }
    }
}

impl SimConfig {
    /// Duration of one I/O cycle.
    pub fn buffer_period(&self) -> Duration {
        Duration::from_secs_f64(self.frames_per_buffer as f64 / self.sample_rate)
    }
}

struct SimTap {
    uid: String,
    channels: u32,
    description: TapDescription,
}

struct SimAggregate {
    uid: String,
    tap_objects: Vec<ObjectId>,
    has_input: bool,
    description: AggregateDeviceDescription,
}

struct SimIoProc {
    device: ObjectId,
    handler: Arc<dyn IoHandler>,
    running: bool,
}

struct HalState {
    next_object: ObjectId,
    next_proc: u64,
    processes: HashSet<ObjectId>,
    output: DeviceInfo,
    input: Option<DeviceInfo>,
    /// Overrides the configured rate and channel count for every format read.
    format_override: Option<StreamDescription>,
    taps: HashMap<ObjectId, SimTap>,
    aggregates: HashMap<ObjectId, SimAggregate>,
    io_procs: BTreeMap<u64, SimIoProc>,
    failures: HashMap<HalOperation, i32>,
    cycles: u64,
}

impl HalState {
    fn allocate(&mut self) -> ObjectId {
        let id = self.next_object;
        self.next_object += 1;
        id
    }

    fn take_failure(&mut self, operation: HalOperation) -> Result<(), HalError> {
        match self.failures.remove(&operation) {
            Some(status) => {
                log::debug!("Injected failure: {} -> {}", operation, status);
                Err(HalError::new(operation, status))
            }
            None => Ok(()),
        }
    }

    fn running_procs(&self) -> usize {
        self.io_procs.values().filter(|p| p.running).count()
    }
}

/// State shared with the I/O thread.
pub(crate) struct Shared {
    config: SimConfig,
    state: Mutex<HalState>,
    source: Mutex<Box<dyn SignalSource>>,
    /// Held for the duration of a delivery cycle; stop and destroy wait on it.
    dispatch: Mutex<()>,
}

impl Shared {
    /// Deliver one buffer cycle to every running I/O proc. Returns the number of handler calls.
    pub(crate) fn run_cycle(&self) -> usize {
        let _cycle = self.dispatch.lock();

        let targets: Vec<(Arc<dyn IoHandler>, u32, Option<u32>)> = {
            let mut state = self.state.lock();
            state.cycles += 1;
            let input_channels = self.config.input_channels;
            state
                .io_procs
                .values()
                .filter(|p| p.running)
                .filter_map(|p| {
                    let aggregate = state.aggregates.get(&p.device)?;
                    let tap_channels = aggregate
                        .tap_objects
                        .first()
                        .and_then(|t| state.taps.get(t))
                        .map(|t| t.channels)
                        .unwrap_or(self.config.tap_channels);
                    let input = aggregate.has_input.then_some(input_channels);
                    Some((Arc::clone(&p.handler), tap_channels, input))
                })
                .collect()
        };

        let frames = self.config.frames_per_buffer;
        let input_frames = self.config.input_frames_per_buffer.unwrap_or(frames);
        let mut source = self.source.lock();

        for (handler, tap_channels, input_channels) in &targets {
            let mut tap = vec![0.0f32; frames * *tap_channels as usize];
            source.fill(0, *tap_channels, &mut tap);

            let input = match input_channels {
                Some(channels) => {
                    let mut input = vec![0.0f32; input_frames * *channels as usize];
                    source.fill(1, *channels, &mut input);
                    input
                }
                None => Vec::new(),
            };

            let mut groups = vec![AudioBuffer::new(*tap_channels, &tap)];
            if let Some(channels) = input_channels {
                groups.push(AudioBuffer::new(*channels, &input));
            }
            handler.process(&groups);
        }
        targets.len()
    }

    fn has_running_procs(&self) -> bool {
        self.state.lock().running_procs() > 0
    }
}

/// A simulated HAL gateway.
///
/// ```ignore
/// let hal = Arc::new(SimulatedHal::new(SimConfig::default()));
/// let tap = TapManager::new(Arc::clone(&hal), &config);
/// tap.activate(&CaptureTarget::system_wide())?;
/// ```
pub struct SimulatedHal {
    shared: Arc<Shared>,
    io_thread: Mutex<Option<IoThread>>,
}

impl SimulatedHal {
    pub fn new(config: SimConfig) -> Self {
        let mut state = HalState {
            next_object: 100,
            next_proc: 1,
            processes: HashSet::new(),
            output: DeviceInfo {
                object_id: 0,
                uid: "SimulatedOutputDevice".into(),
            },
            input: None,
            format_override: None,
            taps: HashMap::new(),
            aggregates: HashMap::new(),
            io_procs: BTreeMap::new(),
            failures: HashMap::new(),
            cycles: 0,
        };
        state.output.object_id = state.allocate();
        if config.has_input_device {
            let object_id = state.allocate();
            state.input = Some(DeviceInfo {
                object_id,
                uid: "SimulatedInputDevice".into(),
            });
        }

        let source = SineSource::new(config.sample_rate, 440.0, 220.0, 0.5);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                source: Mutex::new(Box::new(source)),
                dispatch: Mutex::new(()),
            }),
            io_thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    /// Register a process that taps may target. Returns its object id.
    pub fn add_process(&self, name: &str) -> ObjectId {
        let mut state = self.shared.state.lock();
        let id = state.allocate();
        state.processes.insert(id);
        log::debug!("Simulated process {} is object {}", name, id);
        id
    }

    /// Make the next call of `operation` fail with `status`.
    pub fn fail_next(&self, operation: HalOperation, status: i32) {
        self.shared.state.lock().failures.insert(operation, status);
    }

    /// Report `description` for every stream format read.
    pub fn set_format_override(&self, description: StreamDescription) {
        self.shared.state.lock().format_override = Some(description);
    }

    pub fn set_source(&self, source: impl SignalSource + 'static) {
        *self.shared.source.lock() = Box::new(source);
    }

    /// Deliver `cycles` buffer cycles on the calling thread. Returns handler invocations.
    pub fn pump(&self, cycles: usize) -> usize {
        (0..cycles).map(|_| self.shared.run_cycle()).sum()
    }

    pub fn live_taps(&self) -> usize {
        self.shared.state.lock().taps.len()
    }

    pub fn live_aggregate_devices(&self) -> usize {
        self.shared.state.lock().aggregates.len()
    }

    pub fn live_io_procs(&self) -> usize {
        self.shared.state.lock().io_procs.len()
    }

    pub fn running_devices(&self) -> usize {
        self.shared.state.lock().running_procs()
    }

    /// Total delivery cycles so far, including cycles with no running procs.
    pub fn cycles(&self) -> u64 {
        self.shared.state.lock().cycles
    }

    pub fn tap_descriptions(&self) -> Vec<TapDescription> {
        self.shared
            .state
            .lock()
            .taps
            .values()
            .map(|t| t.description.clone())
            .collect()
    }

    pub fn aggregate_descriptions(&self) -> Vec<AggregateDeviceDescription> {
        self.shared
            .state
            .lock()
            .aggregates
            .values()
            .map(|a| a.description.clone())
            .collect()
    }

    fn bad_object(operation: HalOperation) -> HalError {
        HalError::new(operation, STATUS_BAD_OBJECT)
    }

    fn ensure_io_thread(&self) -> Result<(), HalError> {
        if self.shared.config.clock != Clock::RealTime {
            return Ok(());
        }
        let mut io_thread = self.io_thread.lock();
        if io_thread.is_none() {
            let period = self.shared.config.buffer_period();
            *io_thread = Some(IoThread::spawn(Arc::clone(&self.shared), period)?);
        }
        Ok(())
    }

    fn release_io_thread_if_idle(&self) {
        let mut io_thread = self.io_thread.lock();
        if !self.shared.has_running_procs() {
            if let Some(thread) = io_thread.take() {
                thread.stop();
            }
        }
    }

    /// Wait out any cycle in progress.
    fn barrier(&self) {
        drop(self.shared.dispatch.lock());
    }
}

impl HalGateway for SimulatedHal {
    fn create_tap(&self, description: &TapDescription) -> Result<TapHandle, HalError> {
        let mut state = self.shared.state.lock();
        state.take_failure(HalOperation::CreateTap)?;

        if let TapFilter::Processes(ref processes) = description.filter {
            if processes.is_empty() {
                return Err(HalError::new(HalOperation::CreateTap, STATUS_ILLEGAL_OPERATION));
            }
            if let Some(unknown) = processes.iter().find(|p| !state.processes.contains(p)) {
                log::debug!("Tap requested for unknown process object {}", unknown);
                return Err(Self::bad_object(HalOperation::CreateTap));
            }
        }

        let object_id = state.allocate();
        let channels = if description.mono { 1 } else { self.shared.config.tap_channels };
        state.taps.insert(
            object_id,
            SimTap {
                uid: description.uid.clone(),
                channels,
                description: description.clone(),
            },
        );
        log::debug!("Created tap {} ({})", object_id, description.uid);
        Ok(TapHandle {
            object_id,
            uid: description.uid.clone(),
        })
    }

    fn destroy_tap(&self, tap: TapHandle) -> Result<(), HalError> {
        let mut state = self.shared.state.lock();
        state.take_failure(HalOperation::DestroyTap)?;

        if !state.taps.contains_key(&tap.object_id) {
            return Err(Self::bad_object(HalOperation::DestroyTap));
        }
        if state.aggregates.values().any(|a| a.tap_objects.contains(&tap.object_id)) {
            return Err(HalError::new(HalOperation::DestroyTap, STATUS_ILLEGAL_OPERATION));
        }
        state.taps.remove(&tap.object_id);
        log::debug!("Destroyed tap {}", tap.object_id);
        Ok(())
    }

    fn create_aggregate_device(
        &self,
        description: &AggregateDeviceDescription,
    ) -> Result<AggregateDeviceHandle, HalError> {
        let mut state = self.shared.state.lock();
        state.take_failure(HalOperation::CreateAggregateDevice)?;

        let known_device = |uid: &str| {
            uid == state.output.uid || state.input.as_ref().map(|i| i.uid == uid).unwrap_or(false)
        };
        if !known_device(&description.main_sub_device)
            || !description.sub_devices.iter().all(|d| known_device(&d.uid))
        {
            return Err(Self::bad_object(HalOperation::CreateAggregateDevice));
        }

        let mut tap_objects = Vec::with_capacity(description.taps.len());
        for sub_tap in &description.taps {
            let object = state
                .taps
                .iter()
                .find(|(_, t)| t.uid == sub_tap.uid)
                .map(|(id, _)| *id)
                .ok_or_else(|| Self::bad_object(HalOperation::CreateAggregateDevice))?;
            tap_objects.push(object);
        }

        let has_input = state
            .input
            .as_ref()
            .map(|i| description.sub_devices.iter().any(|d| d.uid == i.uid))
            .unwrap_or(false);

        let object_id = state.allocate();
        state.aggregates.insert(
            object_id,
            SimAggregate {
                uid: description.uid.clone(),
                tap_objects,
                has_input,
                description: description.clone(),
            },
        );
        log::debug!("Created aggregate device {} ({})", object_id, description.uid);
        Ok(AggregateDeviceHandle {
            object_id,
            uid: description.uid.clone(),
        })
    }

    fn destroy_aggregate_device(&self, device: AggregateDeviceHandle) -> Result<(), HalError> {
        let mut state = self.shared.state.lock();
        state.take_failure(HalOperation::DestroyAggregateDevice)?;

        if !state.aggregates.contains_key(&device.object_id) {
            return Err(Self::bad_object(HalOperation::DestroyAggregateDevice));
        }
        if state.io_procs.values().any(|p| p.device == device.object_id) {
            return Err(HalError::new(
                HalOperation::DestroyAggregateDevice,
                STATUS_ILLEGAL_OPERATION,
            ));
        }
        if let Some(aggregate) = state.aggregates.remove(&device.object_id) {
            log::debug!("Destroyed aggregate device {} ({})", device.object_id, aggregate.uid);
        }
        Ok(())
    }

    fn create_io_proc(&self, device: ObjectId, handler: Arc<dyn IoHandler>) -> Result<IoProcId, HalError> {
        let mut state = self.shared.state.lock();
        state.take_failure(HalOperation::CreateIoProc)?;

        if !state.aggregates.contains_key(&device) {
            return Err(Self::bad_object(HalOperation::CreateIoProc));
        }
        let id = state.next_proc;
        state.next_proc += 1;
        state.io_procs.insert(
            id,
            SimIoProc {
                device,
                handler,
                running: false,
            },
        );
        Ok(IoProcId(id))
    }

    fn destroy_io_proc(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError> {
        let removed = {
            let mut state = self.shared.state.lock();
            state.take_failure(HalOperation::DestroyIoProc)?;

            match state.io_procs.get(&proc_id.0) {
                Some(p) if p.device == device => {}
                _ => return Err(Self::bad_object(HalOperation::DestroyIoProc)),
            }
            state.io_procs.remove(&proc_id.0)
        };

        if removed.as_ref().map(|p| p.running).unwrap_or(false) {
            log::debug!("I/O proc {:?} destroyed while running", proc_id);
        }
        self.barrier();
        drop(removed);
        self.release_io_thread_if_idle();
        Ok(())
    }

    fn start_device(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError> {
        {
            let mut state = self.shared.state.lock();
            state.take_failure(HalOperation::StartDevice)?;

            match state.io_procs.get_mut(&proc_id.0) {
                Some(p) if p.device == device => p.running = true,
                _ => return Err(Self::bad_object(HalOperation::StartDevice)),
            }
        }
        self.ensure_io_thread()
    }

    fn stop_device(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError> {
        {
            let mut state = self.shared.state.lock();
            state.take_failure(HalOperation::StopDevice)?;

            match state.io_procs.get_mut(&proc_id.0) {
                Some(p) if p.device == device => p.running = false,
                _ => return Err(Self::bad_object(HalOperation::StopDevice)),
            }
        }
        self.barrier();
        self.release_io_thread_if_idle();
        Ok(())
    }

    fn read_stream_description(&self, object: HalObject, scope: Scope) -> Result<StreamDescription, HalError> {
        let mut state = self.shared.state.lock();
        state.take_failure(HalOperation::ReadStreamDescription)?;
        let config = &self.shared.config;

        let description = match (object, scope) {
            (HalObject::Device(id), Scope::Output) if state.aggregates.contains_key(&id) => {
                if !config.aggregate_format_readable {
                    return Err(HalError::new(HalOperation::ReadStreamDescription, STATUS_UNKNOWN_PROPERTY));
                }
                StreamDescription::interleaved(config.sample_rate, config.output_channels)
            }
            (HalObject::Tap(id), Scope::Global) => {
                let tap = state
                    .taps
                    .get(&id)
                    .ok_or_else(|| Self::bad_object(HalOperation::ReadStreamDescription))?;
                StreamDescription::interleaved(config.sample_rate, tap.channels)
            }
            (HalObject::Device(id), _) | (HalObject::Tap(id), _)
                if state.aggregates.contains_key(&id) || state.taps.contains_key(&id) =>
            {
                return Err(HalError::new(HalOperation::ReadStreamDescription, STATUS_UNKNOWN_PROPERTY));
            }
            _ => return Err(Self::bad_object(HalOperation::ReadStreamDescription)),
        };

        Ok(state.format_override.unwrap_or(description))
    }

    fn default_output_device(&self) -> Result<DeviceInfo, HalError> {
        let mut state = self.shared.state.lock();
        state.take_failure(HalOperation::ReadDefaultOutputDevice)?;
        Ok(state.output.clone())
    }

    fn default_input_device(&self) -> Result<DeviceInfo, HalError> {
        let mut state = self.shared.state.lock();
        state.take_failure(HalOperation::ReadDefaultInputDevice)?;
        state
            .input
            .clone()
            .ok_or_else(|| Self::bad_object(HalOperation::ReadDefaultInputDevice))
    }
}

impl Drop for SimulatedHal {
    fn drop(&mut self) {
        if let Some(thread) = self.io_thread.get_mut().take() {
            thread.stop();
        }
    }
}
