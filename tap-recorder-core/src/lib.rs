//! # tap-recorder-core
//!
//! Platform-agnostic core of the tap recorder.
//!
//! Owns the tap lifecycle, the real-time mixing capture session, float WAV
//! output and the multiplexed upload subsystem. The operating system's audio
//! HAL is reached only through the `HalGateway` trait; backends (the
//! in-process `SimulatedHal`, a Core Audio gateway) plug in there.
//!
//! ## Architecture
//!
//! ```text
//! tap-recorder-core (this crate)
//! ├── traits/       ← HalGateway, IoHandler, FileSink, Transport, CaptureDelegate, UploadDelegate
//! ├── models/       ← CaptureError, HalError, StreamDescription, CaptureTarget, configuration
//! ├── processing/   ← StereoMixer, WAV header generation and parsing
//! ├── session/      ← TapManager, CaptureSession, Recorder
//! ├── storage/      ← WavFileWriter
//! └── upload/       ← UploadMultiplexer, multipart bodies, HttpTransport
//! ```

pub mod models;
pub mod processing;
pub mod session;
pub mod storage;
pub mod traits;
pub mod upload;

// Re-export key types at crate root for convenience.
pub use models::audio_models::{AudioLevels, CaptureSessionDiagnostics};
pub use models::config::{CaptureConfiguration, TapOptions, UploadConfiguration};
pub use models::error::{CaptureError, HalError, HalOperation, UploadError};
pub use models::recording_result::RecordingResult;
pub use models::state::{RecordingState, TapState};
pub use models::stream::{SampleFormat, StreamDescription};
pub use models::target::{CaptureTarget, TargetId};
pub use models::upload::{TaskId, UploadResponse};
pub use processing::stereo_mixer::StereoMixer;
pub use session::capture::CaptureSession;
pub use session::recorder::Recorder;
pub use session::tap_manager::TapManager;
pub use storage::wav_writer::{RecordingStorage, WavFileWriter};
pub use traits::capture_delegate::{CaptureDelegate, UploadDelegate};
pub use traits::file_sink::{FileSink, SinkSummary};
pub use traits::hal_gateway::{HalGateway, IoHandler};
pub use traits::transport::{Transport, TransportDelegate, TransportError, TransportRequest};
pub use upload::multiplexer::{TrackedTasks, UploadHandle, UploadMultiplexer};
pub use upload::transport::HttpTransport;
