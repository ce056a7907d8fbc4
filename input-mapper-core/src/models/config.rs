use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a capture controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfiguration {
    /// Specific input device ID, or None for the platform default.
    ///
    /// Falls back to the default device when the preferred one is absent.
    pub preferred_device_id: Option<String>,

    /// Request the platform's voice-processing input path (default: false).
    pub voice_processing: bool,

    /// Downmix multichannel input to mono before delivery (default: false).
    pub downmix_to_mono: bool,

    /// Quiet gap that ends a notification burst (default: 250ms).
    pub debounce_window: Duration,

    /// Upper bound on how long a burst is collected before it is
    /// delivered anyway (default: 2s).
    pub max_coalesce_delay: Duration,

    /// How long a `start()` queued behind a reconstruction waits (default: 10s).
    pub queued_start_timeout: Duration,
}

impl CaptureConfiguration {
    pub fn validate(&self) -> Result<(), String> {
        if self.debounce_window.is_zero() {
            return Err("debounce window must be positive".into());
        }
        if self.max_coalesce_delay < self.debounce_window {
            return Err(format!(
                "max coalesce delay ({:?}) is shorter than the debounce window ({:?})",
                self.max_coalesce_delay, self.debounce_window
            ));
        }
        if self.queued_start_timeout.is_zero() {
            return Err("queued start timeout must be positive".into());
        }
        if let Some(id) = &self.preferred_device_id {
            if id.trim().is_empty() {
                return Err("preferred device id is empty".into());
            }
        }
        Ok(())
    }
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            preferred_device_id: None,
            voice_processing: false,
            downmix_to_mono: false,
            debounce_window: Duration::from_millis(250),
            max_coalesce_delay: Duration::from_secs(2),
            queued_start_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(CaptureConfiguration::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_debounce() {
        let config = CaptureConfiguration {
            debounce_window: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_max_delay_below_window() {
        let config = CaptureConfiguration {
            debounce_window: Duration::from_millis(500),
            max_coalesce_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("shorter"));
    }

    #[test]
    fn rejects_blank_preferred_device() {
        let config = CaptureConfiguration {
            preferred_device_id: Some("  ".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
