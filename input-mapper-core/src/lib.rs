//! # input-mapper-core
//!
//! Platform-agnostic capture lifecycle for a single audio input device.
//!
//! The [`CaptureController`] owns the device connection, delivers timestamped
//! frames to a [`FrameSink`], and rebuilds the audio chain when the platform
//! reports a device-list, default-device or interruption change. Platform
//! backends (Windows WASAPI) implement [`DevicePlatform`], [`DeviceSession`]
//! and [`NotificationSource`].
//!
//! ## Architecture
//!
//! ```text
//! input-mapper-core (this crate)
//! ├── traits/       ← DevicePlatform, DeviceSession, NotificationSource, FrameSink, CaptureDelegate
//! ├── models/       ← CaptureError, CaptureState, CaptureConfiguration, AudioFrame, etc.
//! ├── processing/   ← mono downmix
//! └── session/      ← CaptureController, ReconstructionDetector
//! ```

pub mod models;
pub mod processing;
pub mod session;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export key types at crate root for convenience.
pub use models::config::CaptureConfiguration;
pub use models::device::DeviceDescriptor;
pub use models::error::CaptureError;
pub use models::frame::{AudioFrame, RawBuffer, EPOCH_MASK, SEQUENCE_EPOCH_SHIFT};
pub use models::notification::{NotificationCounts, PlatformNotification, ReconstructionRequest};
pub use models::report::ReconstructionReport;
pub use models::state::CaptureState;
pub use processing::downmix::downmix_to_mono;
pub use session::controller::{CaptureController, ReconstructionIndicator};
pub use session::detector::{ReconstructionDetector, ReconstructionHandler};
pub use traits::capture_delegate::CaptureDelegate;
pub use traits::device_platform::DevicePlatform;
pub use traits::device_session::{raw_frame_callback, DeviceSession, RawFrameCallback, SessionOptions};
pub use traits::frame_sink::FrameSink;
pub use traits::notification_source::{NotificationListener, NotificationSource};
