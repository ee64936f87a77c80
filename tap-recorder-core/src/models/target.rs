use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a capturable audio source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetId {
    /// Every process on the system; no process filter on the tap.
    SystemWide,
    /// A single process, identified by the opaque id the caller supplied.
    Process(u32),
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemWide => f.write_str("system-wide"),
            Self::Process(id) => write!(f, "process {}", id),
        }
    }
}

/// An audio source the caller picked for recording.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureTarget {
    pub id: TargetId,
    pub display_name: String,
}

impl CaptureTarget {
    pub fn system_wide() -> Self {
        Self {
            id: TargetId::SystemWide,
            display_name: "System Audio".into(),
        }
    }

    pub fn process(object_id: u32, display_name: impl Into<String>) -> Self {
        Self {
            id: TargetId::Process(object_id),
            display_name: display_name.into(),
        }
    }
}
