use std::fmt;

use thiserror::Error;

/// HAL operation that produced a failure status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalOperation {
    CreateTap,
    DestroyTap,
    CreateAggregateDevice,
    DestroyAggregateDevice,
    CreateIoProc,
    DestroyIoProc,
    StartDevice,
    StopDevice,
    ReadStreamDescription,
    ReadDefaultOutputDevice,
    ReadDefaultInputDevice,
}

impl fmt::Display for HalOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateTap => "create tap",
            Self::DestroyTap => "destroy tap",
            Self::CreateAggregateDevice => "create aggregate device",
            Self::DestroyAggregateDevice => "destroy aggregate device",
            Self::CreateIoProc => "create I/O proc",
            Self::DestroyIoProc => "destroy I/O proc",
            Self::StartDevice => "start device",
            Self::StopDevice => "stop device",
            Self::ReadStreamDescription => "read stream description",
            Self::ReadDefaultOutputDevice => "read default output device",
            Self::ReadDefaultInputDevice => "read default input device",
        };
        f.write_str(name)
    }
}

/// Failure reported by the audio HAL, carrying its raw status code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{operation} failed with status {status}")]
pub struct HalError {
    pub operation: HalOperation,
    pub status: i32,
}

impl HalError {
    pub fn new(operation: HalOperation, status: i32) -> Self {
        Self { operation, status }
    }
}

/// Errors that can occur while activating a tap or running a capture session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capability error: {0}")]
    Capability(#[from] HalError),

    #[error("invalid stream format: {0}")]
    InvalidFormat(String),

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("tap is not activated")]
    NotActivated,

    #[error("tap has been invalidated")]
    Invalidated,

    #[error("capture session already running")]
    AlreadyRunning,

    #[error("capture session was never started")]
    NotStarted,

    #[error("capture session already finished")]
    SessionFinished,
}

impl CaptureError {
    /// The HAL status code, for capability errors.
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Capability(e) => Some(e.status),
            _ => None,
        }
    }
}

/// Errors surfaced to the caller of a single upload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("failed to read recording: {0}")]
    Io(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("bad status: {0}")]
    BadStatus(u16),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("upload abandoned before completion")]
    Abandoned,

    #[error("invalid upload configuration: {0}")]
    Configuration(String),
}
