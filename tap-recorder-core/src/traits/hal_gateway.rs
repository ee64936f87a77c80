use std::sync::Arc;

use crate::models::error::HalError;
use crate::models::hal::{
    AggregateDeviceDescription, AggregateDeviceHandle, AudioBuffer, DeviceInfo, HalObject, IoProcId, ObjectId,
    Scope, TapDescription, TapHandle,
};
use crate::models::stream::StreamDescription;

/// Real-time audio handler registered as a device's I/O proc.
///
/// `process` runs on the HAL's high-priority I/O thread: it must not block,
/// allocate without bound, or touch file-system metadata.
pub trait IoHandler: Send + Sync {
    /// Called with one buffer group per sub-device stream, in sub-device order.
    fn process(&self, input: &[AudioBuffer<'_>]);
}

/// Capability interface of the operating system's audio HAL.
///
/// Implemented by:
/// - `SimulatedHal` (tap-recorder-sim)
/// - Future: a Core Audio backend on macOS 14.4+
///
/// Object lifetimes are the caller's responsibility. Aggregate devices must be
/// destroyed before the taps they contain, and a device must be stopped
/// before its I/O proc is destroyed. Once `destroy_io_proc` returns, the
/// gateway never invokes that handler again and drops its reference to it.
pub trait HalGateway: Send + Sync {
    fn create_tap(&self, description: &TapDescription) -> Result<TapHandle, HalError>;

    fn destroy_tap(&self, tap: TapHandle) -> Result<(), HalError>;

    fn create_aggregate_device(
        &self,
        description: &AggregateDeviceDescription,
    ) -> Result<AggregateDeviceHandle, HalError>;

    fn destroy_aggregate_device(&self, device: AggregateDeviceHandle) -> Result<(), HalError>;

    fn create_io_proc(&self, device: ObjectId, handler: Arc<dyn IoHandler>) -> Result<IoProcId, HalError>;

    fn destroy_io_proc(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError>;

    fn start_device(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError>;

    fn stop_device(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError>;

    fn read_stream_description(&self, object: HalObject, scope: Scope) -> Result<StreamDescription, HalError>;

    fn default_output_device(&self) -> Result<DeviceInfo, HalError>;

    fn default_input_device(&self) -> Result<DeviceInfo, HalError>;
}

impl<T: HalGateway + ?Sized> HalGateway for Arc<T> {
    fn create_tap(&self, description: &TapDescription) -> Result<TapHandle, HalError> {
        (**self).create_tap(description)
    }

    fn destroy_tap(&self, tap: TapHandle) -> Result<(), HalError> {
        (**self).destroy_tap(tap)
    }

    fn create_aggregate_device(
        &self,
        description: &AggregateDeviceDescription,
    ) -> Result<AggregateDeviceHandle, HalError> {
        (**self).create_aggregate_device(description)
    }

    fn destroy_aggregate_device(&self, device: AggregateDeviceHandle) -> Result<(), HalError> {
        (**self).destroy_aggregate_device(device)
    }

    fn create_io_proc(&self, device: ObjectId, handler: Arc<dyn IoHandler>) -> Result<IoProcId, HalError> {
        (**self).create_io_proc(device, handler)
    }

    fn destroy_io_proc(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError> {
        (**self).destroy_io_proc(device, proc_id)
    }

    fn start_device(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError> {
        (**self).start_device(device, proc_id)
    }

    fn stop_device(&self, device: ObjectId, proc_id: IoProcId) -> Result<(), HalError> {
        (**self).stop_device(device, proc_id)
    }

    fn read_stream_description(&self, object: HalObject, scope: Scope) -> Result<StreamDescription, HalError> {
        (**self).read_stream_description(object, scope)
    }

    fn default_output_device(&self) -> Result<DeviceInfo, HalError> {
        (**self).default_output_device()
    }

    fn default_input_device(&self) -> Result<DeviceInfo, HalError> {
        (**self).default_input_device()
    }
}
