//! Windows capture device enumeration via the MMDevice API.
//!
//! Wraps `IMMDeviceEnumerator` to list capture (microphone) endpoints with
//! friendly names and their shared-mode mix format.

use windows::Win32::Devices::FunctionDiscovery::*;
use windows::Win32::Foundation::E_NOTFOUND;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;

use input_mapper_core::models::device::DeviceDescriptor;
use input_mapper_core::models::error::CaptureError;
use input_mapper_core::traits::device_platform::DevicePlatform;

use crate::com;
use crate::device_watcher::DeviceSnapshot;

/// Capture device enumerator using the Windows MMDevice API.
pub struct DeviceEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl DeviceEnumerator {
    /// Create a new device enumerator.
    ///
    /// Requires COM to be initialized on the calling thread.
    pub fn new() -> Result<Self, CaptureError> {
        unsafe {
            let enumerator: IMMDeviceEnumerator = CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                .map_err(|e| CaptureError::Platform(format!("failed to create enumerator: {}", e)))?;
            Ok(Self { enumerator })
        }
    }

    /// List active capture endpoints whose mix format could be read.
    pub fn list_capture_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(eCapture, DEVICE_STATE_ACTIVE)
                .map_err(|e| CaptureError::Platform(format!("EnumAudioEndpoints failed: {}", e)))?;

            let count = collection
                .GetCount()
                .map_err(|e| CaptureError::Platform(format!("GetCount failed: {}", e)))?;

            let mut devices = Vec::new();
            for i in 0..count {
                let Ok(device) = collection.Item(i) else {
                    continue;
                };
                match Self::describe(&device) {
                    Ok(descriptor) => devices.push(descriptor),
                    Err(e) => log::debug!("Skipping capture endpoint {}: {}", i, e),
                }
            }
            Ok(devices)
        }
    }

    /// The default console capture endpoint, or None when there is none.
    pub fn default_capture_device(&self) -> Result<Option<DeviceDescriptor>, CaptureError> {
        unsafe {
            match self.enumerator.GetDefaultAudioEndpoint(eCapture, eConsole) {
                Ok(device) => Self::describe(&device).map(Some),
                Err(e) if e.code() == E_NOTFOUND => Ok(None),
                Err(e) => Err(CaptureError::Platform(format!("GetDefaultAudioEndpoint failed: {}", e))),
            }
        }
    }

    /// Endpoint ids only, for cheap change polling.
    pub fn snapshot(&self) -> Result<DeviceSnapshot, CaptureError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(eCapture, DEVICE_STATE_ACTIVE)
                .map_err(|e| CaptureError::Platform(format!("EnumAudioEndpoints failed: {}", e)))?;
            let count = collection
                .GetCount()
                .map_err(|e| CaptureError::Platform(format!("GetCount failed: {}", e)))?;

            let ids = (0..count)
                .filter_map(|i| collection.Item(i).ok())
                .filter_map(|device| Self::device_id(&device))
                .collect();
            let default_id = self
                .enumerator
                .GetDefaultAudioEndpoint(eCapture, eConsole)
                .ok()
                .and_then(|device| Self::device_id(&device));
            Ok(DeviceSnapshot::new(default_id, ids))
        }
    }

    fn describe(device: &IMMDevice) -> Result<DeviceDescriptor, CaptureError> {
        let id = Self::device_id(device).ok_or_else(|| CaptureError::Platform("GetId failed".into()))?;
        let name = Self::friendly_name(device).unwrap_or_else(|| "Unknown microphone".into());
        let (sample_rate, channels) = Self::mix_format(device)?;
        Ok(DeviceDescriptor::new(id, name, sample_rate, channels))
    }

    fn device_id(device: &IMMDevice) -> Option<String> {
        unsafe {
            let id = device.GetId().ok()?;
            let text = id.to_string().ok();
            CoTaskMemFree(Some(id.0 as *const _));
            text
        }
    }

    /// Read the PKEY_Device_FriendlyName property from a device.
    fn friendly_name(device: &IMMDevice) -> Option<String> {
        unsafe {
            let store = device.OpenPropertyStore(STGM_READ).ok()?;
            let value = store.GetValue(&PKEY_Device_FriendlyName).ok()?;
            let name = value.to_string();
            (!name.is_empty()).then_some(name)
        }
    }

    /// Shared-mode sample rate and channel count.
    fn mix_format(device: &IMMDevice) -> Result<(u32, u16), CaptureError> {
        unsafe {
            let audio_client: IAudioClient = device
                .Activate(CLSCTX_ALL, None)
                .map_err(|e| CaptureError::Platform(format!("Activate failed: {}", e)))?;
            let format_ptr = audio_client
                .GetMixFormat()
                .map_err(|e| CaptureError::Platform(format!("GetMixFormat failed: {}", e)))?;
            let format = &*format_ptr;
            let result = (format.nSamplesPerSec, format.nChannels);
            CoTaskMemFree(Some(format_ptr as *const _));
            Ok(result)
        }
    }
}

/// [`DevicePlatform`] over the MMDevice API.
///
/// Each query joins the MTA on the calling thread and creates a fresh
/// enumerator, because COM interfaces are not `Send`. The enumerator is
/// always released before the apartment guard drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct WasapiPlatform;

impl WasapiPlatform {
    pub fn snapshot(&self) -> Result<DeviceSnapshot, CaptureError> {
        let _com = com::initialize_mta()?;
        let result = DeviceEnumerator::new()?.snapshot();
        result
    }
}

impl DevicePlatform for WasapiPlatform {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let _com = com::initialize_mta()?;
        let result = DeviceEnumerator::new()?.list_capture_devices();
        result
    }

    fn default_input_device(&self) -> Result<Option<DeviceDescriptor>, CaptureError> {
        let _com = com::initialize_mta()?;
        let result = DeviceEnumerator::new()?.default_capture_device();
        result
    }
}
