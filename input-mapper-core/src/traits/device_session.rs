use std::sync::Arc;

use crate::models::device::DeviceDescriptor;
use crate::models::error::CaptureError;
use crate::models::frame::RawBuffer;

/// Callback invoked with every buffer the device produces.
///
/// Fires on the session's real-time thread; keep processing minimal.
pub type RawFrameCallback = Arc<dyn Fn(RawBuffer<'_>) + Send + Sync + 'static>;

/// Options applied when opening a device session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Route input through the platform's voice-processing unit where one exists.
    pub voice_processing: bool,
}

/// Connection to one input device.
///
/// Implemented by:
/// - `WasapiDeviceSession` (Windows)
/// - `FakeDeviceSession` (tests)
///
/// All methods take `&self`: `close` may be called from teardown while
/// another thread is still inside `open`, and the implementation must end
/// up closed in that case.
pub trait DeviceSession: Send + Sync {
    /// Install the callback that receives raw buffers. Replaces any previous one.
    fn on_frame(&self, callback: RawFrameCallback);

    /// Start capturing from `descriptor`.
    ///
    /// Fails with `StartFailed` if the descriptor is stale or the device went
    /// away after it was acquired, and `DeviceBusy` if another client holds it.
    fn open(&self, descriptor: &DeviceDescriptor, options: &SessionOptions) -> Result<(), CaptureError>;

    /// Stop capturing and release the device. Idempotent.
    ///
    /// Returns without waiting for an `open` in progress on another thread;
    /// that `open` then fails and leaves the session closed.
    fn close(&self);
}

/// Box a closure as a [`RawFrameCallback`].
pub fn raw_frame_callback<F>(callback: F) -> RawFrameCallback
where
    F: Fn(RawBuffer<'_>) + Send + Sync + 'static,
{
    Arc::new(callback)
}
