use serde::{Deserialize, Serialize};

/// Raw notification emitted by the platform audio subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformNotification {
    DeviceListChanged,
    DefaultDeviceChanged,
    Interrupted,
    Resumed,
}

/// Per-kind counts of the raw notifications folded into one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationCounts {
    pub device_list_changed: u32,
    pub default_device_changed: u32,
    pub interrupted: u32,
    pub resumed: u32,
}

impl NotificationCounts {
    pub fn record(&mut self, notification: PlatformNotification) {
        match notification {
            PlatformNotification::DeviceListChanged => self.device_list_changed += 1,
            PlatformNotification::DefaultDeviceChanged => self.default_device_changed += 1,
            PlatformNotification::Interrupted => self.interrupted += 1,
            PlatformNotification::Resumed => self.resumed += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.device_list_changed + self.default_device_changed + self.interrupted + self.resumed
    }
}

/// Coalesced "reconstruction requested" signal delivered to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionRequest {
    pub counts: NotificationCounts,
    /// The platform session is still interrupted at the end of the burst.
    pub interrupted: bool,
}

impl ReconstructionRequest {
    /// Classifies a burst of notifications, given whether the session was
    /// interrupted before the burst began.
    pub fn classify(burst: &[PlatformNotification], was_interrupted: bool) -> Self {
        let mut counts = NotificationCounts::default();
        let mut interrupted = was_interrupted;
        for &notification in burst {
            counts.record(notification);
            match notification {
                PlatformNotification::Interrupted => interrupted = true,
                PlatformNotification::Resumed => interrupted = false,
                _ => {}
            }
        }
        Self { counts, interrupted }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PlatformNotification::*;

    #[test]
    fn classify_counts_every_kind() {
        let request = ReconstructionRequest::classify(
            &[DeviceListChanged, DefaultDeviceChanged, DeviceListChanged],
            false,
        );
        assert_eq!(request.counts.device_list_changed, 2);
        assert_eq!(request.counts.default_device_changed, 1);
        assert_eq!(request.counts.total(), 3);
        assert!(!request.interrupted);
    }

    #[test]
    fn last_interruption_event_wins() {
        assert!(ReconstructionRequest::classify(&[Resumed, Interrupted], false).interrupted);
        assert!(!ReconstructionRequest::classify(&[Interrupted, Resumed], false).interrupted);
    }

    #[test]
    fn interruption_persists_across_bursts() {
        assert!(ReconstructionRequest::classify(&[DeviceListChanged], true).interrupted);
        assert!(!ReconstructionRequest::classify(&[Resumed], true).interrupted);
    }
}
