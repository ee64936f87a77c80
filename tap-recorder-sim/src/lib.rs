//! # tap-recorder-sim
//!
//! In-process HAL backend for tap-recorder.
//!
//! Provides:
//! - `SimulatedHal`: a `HalGateway` with taps, aggregate devices, I/O procs
//!   and failure injection
//! - `SineSource` / `ConstantSource`: signals delivered to the buffer groups
//! - `Clock::Manual` (deliver with `pump`) or `Clock::RealTime` (named I/O thread)
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use tap_recorder_core::{CaptureConfiguration, CaptureTarget, Recorder};
//! use tap_recorder_sim::{SimConfig, SimulatedHal};
//!
//! let hal = Arc::new(SimulatedHal::new(SimConfig::default()));
//! let recorder: Recorder<SimulatedHal> = Recorder::new(hal.clone(), CaptureConfiguration::default())?;
//! recorder.start_recording(CaptureTarget::system_wide())?;
//! hal.pump(100);
//! let result = recorder.stop_recording()?;
//! ```

mod io_thread;
pub mod signal;
pub mod simulated_hal;

pub use signal::{ConstantSource, SignalSource, SineSource};
pub use simulated_hal::{
    Clock, SimConfig, SimulatedHal, STATUS_BAD_OBJECT, STATUS_ILLEGAL_OPERATION, STATUS_UNKNOWN_PROPERTY,
};
