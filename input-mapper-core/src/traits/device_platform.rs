use crate::models::device::DeviceDescriptor;
use crate::models::error::CaptureError;

/// Device enumeration side of the platform audio subsystem.
pub trait DevicePlatform: Send + Sync {
    /// All input devices currently present.
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    /// The system default input device, or None if there is no input device.
    fn default_input_device(&self) -> Result<Option<DeviceDescriptor>, CaptureError>;

    /// Resolve the device to capture from: the preferred device when it is
    /// present, otherwise the default.
    fn resolve_input_device(&self, preferred_id: Option<&str>) -> Result<Option<DeviceDescriptor>, CaptureError> {
        if let Some(id) = preferred_id {
            if let Some(device) = self.input_devices()?.into_iter().find(|d| d.id == id) {
                return Ok(Some(device));
            }
            log::info!("Preferred input device {} not present, using default", id);
        }
        self.default_input_device()
    }
}
