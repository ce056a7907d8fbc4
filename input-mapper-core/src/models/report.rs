use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::device::DeviceDescriptor;
use super::error::CaptureError;
use super::notification::ReconstructionRequest;

/// Summary of one reconstruction cycle, handed to the delegate.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionReport {
    pub id: Uuid,
    pub request: ReconstructionRequest,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_device: Option<DeviceDescriptor>,
    pub new_device: Option<DeviceDescriptor>,
    /// Capture was reopened against `new_device`.
    pub restarted: bool,
    /// The cycle ended suspended by a platform interruption.
    pub suspended: bool,
    pub error: Option<CaptureError>,
}

impl ReconstructionReport {
    pub(crate) fn begin(request: ReconstructionRequest, previous_device: Option<DeviceDescriptor>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request,
            started_at: now,
            finished_at: now,
            previous_device,
            new_device: None,
            restarted: false,
            suspended: false,
            error: None,
        }
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn device_changed(&self) -> bool {
        self.previous_device != self.new_device
    }
}
