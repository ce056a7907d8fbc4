use std::sync::Arc;

use crate::models::error::CaptureError;
use crate::models::notification::PlatformNotification;

/// Listener registered with a [`NotificationSource`].
///
/// May be invoked from inside a platform callback; it only forwards.
pub type NotificationListener = Arc<dyn Fn(PlatformNotification) + Send + Sync + 'static>;

/// Device / route / interruption notifications from the platform.
pub trait NotificationSource: Send + Sync {
    /// Start reporting notifications to `listener`, replacing any previous one.
    fn register(&self, listener: NotificationListener) -> Result<(), CaptureError>;

    /// Stop reporting. Idempotent.
    fn unregister(&self);
}
