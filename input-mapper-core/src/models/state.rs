use serde::{Deserialize, Serialize};

/// Capture lifecycle state machine.
///
/// State transitions:
/// ```text
/// uninitialized → configured ⇄ running
///                     ↑    ↖       ↓
///                  stopped   stopping
///
/// any state → torn down (terminal)
/// ```
///
/// `Stopped` is entered when a reconstruction could not re-acquire a device;
/// it holds no descriptor and is left through `start()` or the next
/// reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Uninitialized,
    Configured,
    Running,
    Stopping,
    Stopped,
    TornDown,
}

impl CaptureState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TornDown)
    }

    /// Whether the controller holds a device descriptor in this state.
    pub fn holds_descriptor(&self) -> bool {
        matches!(self, Self::Configured | Self::Running | Self::Stopping)
    }

    /// Whether reconstruction signals are acted upon in this state.
    pub fn accepts_reconstruction(&self) -> bool {
        matches!(self, Self::Configured | Self::Running | Self::Stopped)
    }

    /// `setup()` is a no-op success once past `Uninitialized`.
    pub fn is_set_up(&self) -> bool {
        matches!(
            self,
            Self::Configured | Self::Running | Self::Stopping | Self::Stopped
        )
    }
}
