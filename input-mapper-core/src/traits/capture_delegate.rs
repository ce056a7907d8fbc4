use crate::models::error::CaptureError;
use crate::models::report::ReconstructionReport;
use crate::models::state::CaptureState;

/// Event delegate for capture controller notifications.
///
/// Methods are called from whichever thread caused the event: the control
/// thread for explicit operations, the detector thread for reconstruction.
/// Never from the real-time capture thread. Implementations should marshal
/// to the UI thread if needed.
pub trait CaptureDelegate: Send + Sync {
    /// Called after every state transition.
    fn on_state_changed(&self, state: CaptureState);

    /// Called when a reconstruction cycle begins.
    fn on_reconstruction_started(&self) {}

    /// Called when a reconstruction cycle completes, fails, or suspends.
    fn on_reconstruction_finished(&self, report: &ReconstructionReport);

    /// Called with errors that have no waiting caller.
    fn on_error(&self, error: &CaptureError);
}
