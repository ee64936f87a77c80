use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::config::{CaptureConfiguration, TapOptions};
use crate::models::error::{CaptureError, HalError};
use crate::models::hal::{
    AggregateDeviceDescription, AggregateDeviceHandle, HalObject, IoProcId, NegotiatedFormat, ObjectId, Scope,
    SubDevice, SubTap, TapDescription, TapFilter, TapHandle,
};
use crate::models::state::TapState;
use crate::models::stream::StreamDescription;
use crate::models::target::{CaptureTarget, TargetId};
use crate::traits::capture_delegate::CaptureDelegate;
use crate::traits::hal_gateway::{HalGateway, IoHandler};

type InvalidationHandler = Box<dyn FnOnce() + Send>;

/// I/O proc currently registered on the aggregate device.
#[derive(Debug, Clone, Copy)]
struct IoBinding {
    device: ObjectId,
    proc_id: IoProcId,
    running: bool,
}

struct TapInner {
    state: TapState,
    target: Option<CaptureTarget>,
    tap: Option<TapHandle>,
    aggregate: Option<AggregateDeviceHandle>,
    format: Option<NegotiatedFormat>,
    io: Option<IoBinding>,
}

impl TapInner {
    fn new() -> Self {
        Self {
            state: TapState::Idle,
            target: None,
            tap: None,
            aggregate: None,
            format: None,
            io: None,
        }
    }
}

/// Owns one process tap and the private aggregate device that makes it
/// readable as a clock-synchronized stream.
///
/// ```text
/// activate(target)
///   1. create tap (no process filter for system-wide)
///   2. resolve default output (+ input) device UIDs
///   3. describe aggregate: tap (drift compensated) + output as clock (+ input)
///   4. create aggregate device
///   5. read output-scope format, falling back to the tap format
///
/// invalidate()
///   stop I/O → destroy I/O proc → destroy aggregate → destroy tap → notify
/// ```
///
/// Any failing activation step destroys what earlier steps created and
/// leaves the manager idle.
pub struct TapManager<H: HalGateway> {
    hal: H,
    options: TapOptions,
    include_microphone: bool,
    inner: Mutex<TapInner>,
    delegate: Mutex<Option<Arc<dyn CaptureDelegate>>>,
    invalidation_handler: Mutex<Option<InvalidationHandler>>,
}

impl<H: HalGateway> TapManager<H> {
    pub fn new(hal: H, config: &CaptureConfiguration) -> Self {
        Self {
            hal,
            options: config.tap.clone(),
            include_microphone: config.include_microphone,
            inner: Mutex::new(TapInner::new()),
            delegate: Mutex::new(None),
            invalidation_handler: Mutex::new(None),
        }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn CaptureDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    /// Register the observer called once when the tap is invalidated.
    pub fn set_invalidation_handler(&self, handler: impl FnOnce() + Send + 'static) {
        *self.invalidation_handler.lock() = Some(Box::new(handler));
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn state(&self) -> TapState {
        self.inner.lock().state
    }

    pub fn target(&self) -> Option<CaptureTarget> {
        self.inner.lock().target.clone()
    }

    /// Format negotiated by the last successful activation.
    pub fn stream_description(&self) -> Option<StreamDescription> {
        self.inner.lock().format.map(|f| f.description)
    }

    pub fn negotiated_format(&self) -> Option<NegotiatedFormat> {
        self.inner.lock().format
    }

    pub fn aggregate_device_id(&self) -> Option<ObjectId> {
        self.inner.lock().aggregate.as_ref().map(|a| a.object_id)
    }

    pub fn tap_uid(&self) -> Option<String> {
        self.inner.lock().tap.as_ref().map(|t| t.uid.clone())
    }

    pub fn is_io_running(&self) -> bool {
        self.inner.lock().io.map(|io| io.running).unwrap_or(false)
    }

    /// Create the tap and aggregate device for `target`.
    ///
    /// A no-op when already activated.
    pub fn activate(&self, target: &CaptureTarget) -> Result<(), CaptureError> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                TapState::Activated => {
                    if inner.target.as_ref() != Some(target) {
                        log::debug!(
                            "Tap already activated for {:?}; ignoring activation for {}",
                            inner.target.as_ref().map(|t| t.id),
                            target.id
                        );
                    }
                    return Ok(());
                }
                TapState::Invalidated => return Err(CaptureError::Invalidated),
                TapState::Idle => {}
            }

            log::info!("Activating tap for {} ({})", target.display_name, target.id);
            let (tap, aggregate, format) = self.create_objects(target)?;

            log::info!(
                "Tap activated: aggregate {} at {} Hz, {} channels ({})",
                aggregate.uid,
                format.description.sample_rate,
                format.description.channels,
                if format.from_aggregate { "aggregate output" } else { "tap fallback" }
            );

            inner.tap = Some(tap);
            inner.aggregate = Some(aggregate);
            inner.format = Some(format);
            inner.target = Some(target.clone());
            inner.state = TapState::Activated;
        }

        self.notify(target, TapState::Activated);
        Ok(())
    }

    /// Tear everything down. Destroy failures are logged, not returned.
    ///
    /// A no-op unless activated.
    pub fn invalidate(&self) {
        let target = {
            let mut inner = self.inner.lock();
            if !inner.state.is_activated() {
                return;
            }
            log::info!("Invalidating tap");

            if let Some(io) = inner.io.take() {
                self.release_io(io);
            }
            let aggregate = inner.aggregate.take();
            let tap = inner.tap.take();
            self.destroy_objects(aggregate, tap);

            inner.format = None;
            inner.state = TapState::Invalidated;
            inner.target.clone()
        };

        if let Some(handler) = self.invalidation_handler.lock().take() {
            handler();
        }
        if let Some(target) = target {
            self.notify(&target, TapState::Invalidated);
        }
    }

    /// Register `handler` as the aggregate device's I/O proc.
    pub fn bind_io(&self, handler: Arc<dyn IoHandler>) -> Result<IoProcId, CaptureError> {
        let mut inner = self.inner.lock();
        if !inner.state.is_activated() {
            return Err(CaptureError::NotActivated);
        }
        if inner.io.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let device = inner
            .aggregate
            .as_ref()
            .map(|a| a.object_id)
            .ok_or(CaptureError::NotActivated)?;

        let proc_id = self.hal.create_io_proc(device, handler)?;
        inner.io = Some(IoBinding {
            device,
            proc_id,
            running: false,
        });
        log::debug!("Registered I/O proc {:?} on device {}", proc_id, device);
        Ok(proc_id)
    }

    /// Start the aggregate device with the bound I/O proc.
    pub fn start_io(&self) -> Result<(), CaptureError> {
        let mut inner = self.inner.lock();
        let io = inner.io.as_mut().ok_or(CaptureError::NotActivated)?;
        if io.running {
            return Ok(());
        }
        self.hal.start_device(io.device, io.proc_id)?;
        io.running = true;
        Ok(())
    }

    /// Stop the device and destroy the I/O proc. Returns `false` if nothing was bound.
    ///
    /// Once this returns the handler is never invoked again.
    pub fn unbind_io(&self) -> bool {
        let io = self.inner.lock().io.take();
        match io {
            Some(io) => {
                self.release_io(io);
                true
            }
            None => false,
        }
    }

    fn release_io(&self, io: IoBinding) {
        if io.running {
            if let Err(e) = self.hal.stop_device(io.device, io.proc_id) {
                log::warn!("Failed to stop device {}: {}", io.device, e);
            }
        }
        if let Err(e) = self.hal.destroy_io_proc(io.device, io.proc_id) {
            log::warn!("Failed to destroy I/O proc {:?}: {}", io.proc_id, e);
        }
    }

    fn create_objects(
        &self,
        target: &CaptureTarget,
    ) -> Result<(TapHandle, AggregateDeviceHandle, NegotiatedFormat), CaptureError> {
        let tap_description = self.tap_description(target);
        let tap = self.hal.create_tap(&tap_description).map_err(|e| {
            log::error!("Failed to create tap for {}: {}", target.id, e);
            CaptureError::from(e)
        })?;

        let aggregate_description = match self.aggregate_description(&tap) {
            Ok(description) => description,
            Err(e) => {
                log::error!("Failed to resolve devices for aggregate: {}", e);
                self.destroy_objects(None, Some(tap));
                return Err(e.into());
            }
        };

        let aggregate = match self.hal.create_aggregate_device(&aggregate_description) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                log::error!("Failed to create aggregate device: {}", e);
                self.destroy_objects(None, Some(tap));
                return Err(e.into());
            }
        };

        match self.read_format(&tap, &aggregate) {
            Ok(format) => Ok((tap, aggregate, format)),
            Err(e) => {
                log::error!("Failed to negotiate stream format: {}", e);
                self.destroy_objects(Some(aggregate), Some(tap));
                Err(e)
            }
        }
    }

    fn tap_description(&self, target: &CaptureTarget) -> TapDescription {
        let filter = match target.id {
            TargetId::SystemWide => TapFilter::AllProcesses,
            TargetId::Process(object_id) => TapFilter::Processes(vec![object_id]),
        };
        TapDescription {
            uid: uuid::Uuid::new_v4().to_string(),
            name: format!("{}-tap", self.options.name),
            filter,
            mono: self.options.mono,
            private: self.options.private,
            muted: self.options.muted,
        }
    }

    fn aggregate_description(&self, tap: &TapHandle) -> Result<AggregateDeviceDescription, HalError> {
        let output = self.hal.default_output_device()?;
        let mut sub_devices = vec![SubDevice {
            uid: output.uid.clone(),
            drift_compensation: false,
        }];

        if self.include_microphone {
            let input = self.hal.default_input_device()?;
            sub_devices.push(SubDevice {
                uid: input.uid,
                drift_compensation: true,
            });
        }

        Ok(AggregateDeviceDescription {
            uid: uuid::Uuid::new_v4().to_string(),
            name: format!("{}-aggregate", self.options.name),
            main_sub_device: output.uid,
            sub_devices,
            taps: vec![SubTap {
                uid: tap.uid.clone(),
                drift_compensation: true,
            }],
            is_private: self.options.private,
            is_stacked: false,
            tap_auto_start: true,
        })
    }

    fn read_format(
        &self,
        tap: &TapHandle,
        aggregate: &AggregateDeviceHandle,
    ) -> Result<NegotiatedFormat, CaptureError> {
        let format = match self
            .hal
            .read_stream_description(HalObject::Device(aggregate.object_id), Scope::Output)
        {
            Ok(description) => NegotiatedFormat {
                description,
                from_aggregate: true,
            },
            Err(e) => {
                log::warn!("Aggregate format unavailable ({}); using tap format", e);
                let description = self
                    .hal
                    .read_stream_description(HalObject::Tap(tap.object_id), Scope::Global)?;
                NegotiatedFormat {
                    description,
                    from_aggregate: false,
                }
            }
        };
        format.description.validate()?;
        Ok(format)
    }

    /// Destroy in dependency order: aggregate device first, then the tap.
    fn destroy_objects(&self, aggregate: Option<AggregateDeviceHandle>, tap: Option<TapHandle>) {
        if let Some(aggregate) = aggregate {
            let uid = aggregate.uid.clone();
            if let Err(e) = self.hal.destroy_aggregate_device(aggregate) {
                log::warn!("Failed to destroy aggregate device {}: {}", uid, e);
            }
        }
        if let Some(tap) = tap {
            let uid = tap.uid.clone();
            if let Err(e) = self.hal.destroy_tap(tap) {
                log::warn!("Failed to destroy tap {}: {}", uid, e);
            }
        }
    }

    fn notify(&self, target: &CaptureTarget, state: TapState) {
        let delegate = self.delegate.lock().clone();
        if let Some(delegate) = delegate {
            delegate.on_tap_state_changed(target, state);
        }
    }
}

impl<H: HalGateway> Drop for TapManager<H> {
    fn drop(&mut self) {
        self.invalidate();
    }
}
