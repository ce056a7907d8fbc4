use thiserror::Error;

use super::state::CaptureState;

/// Errors that can occur during capture lifecycle operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no input device available")]
    DeviceUnavailable,

    #[error("input device is busy")]
    DeviceBusy,

    #[error("capture failed to start: {0}")]
    StartFailed(String),

    #[error("capture controller already torn down")]
    AlreadyTornDown,

    #[error("{operation} is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CaptureState,
    },

    #[error("timeout")]
    Timeout,

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("platform error: {0}")]
    Platform(String),
}

impl CaptureError {
    /// Errors that mean the device exists but capture could not be started.
    pub fn is_start_failure(&self) -> bool {
        matches!(self, Self::DeviceBusy | Self::StartFailed(_))
    }
}
