/// Tap lifecycle state machine.
///
/// ```text
/// idle → activated → invalidated
///   ↑        │
///   └────────┘ (activation failure rolls back to idle)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    Idle,
    Activated,
    Invalidated,
}

impl TapState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_activated(&self) -> bool {
        matches!(self, Self::Activated)
    }
}

/// Capture session state.
///
/// ```text
/// ready → recording → stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Ready,
    Recording,
    Stopped,
}

impl RecordingState {
    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording)
    }
}
