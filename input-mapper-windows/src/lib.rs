//! # input-mapper-windows
//!
//! Windows WASAPI backend for input-mapper.
//!
//! Provides:
//! - `WasapiDeviceSession`: microphone capture via a WASAPI capture endpoint
//! - `WasapiPlatform`: capture device enumeration via the MMDevice API
//! - `DeviceWatcher`: polling notification source for device changes
//!
//! ## Platform Requirements
//! - Windows 10 or later
//! - Visual Studio Build Tools 2022 + Windows SDK for linking
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use input_mapper_core::{CaptureConfiguration, CaptureController};
//! use input_mapper_windows::{DeviceWatcher, WasapiDeviceSession, WasapiPlatform, DEFAULT_POLL_INTERVAL};
//!
//! let controller = CaptureController::new(
//!     Arc::new(WasapiPlatform),
//!     Arc::new(WasapiDeviceSession::new()),
//!     Arc::new(DeviceWatcher::wasapi(DEFAULT_POLL_INTERVAL)?),
//!     Arc::new(|frame: input_mapper_core::AudioFrame| println!("{}", frame.sequence())),
//!     CaptureConfiguration::default(),
//! )?;
//! controller.setup()?;
//! controller.start()?;
//! ```

#[cfg(target_os = "windows")]
mod com;
#[cfg(target_os = "windows")]
pub mod device_enumerator;
pub mod device_watcher;
#[cfg(target_os = "windows")]
pub mod wasapi_session;

#[cfg(target_os = "windows")]
pub use device_enumerator::{DeviceEnumerator, WasapiPlatform};
pub use device_watcher::{DeviceSnapshot, DeviceWatcher, SnapshotProbe, DEFAULT_POLL_INTERVAL};
#[cfg(target_os = "windows")]
pub use wasapi_session::WasapiDeviceSession;
