//! Polling notification source for platforms without a usable push API.
//!
//! Compares successive [`DeviceSnapshot`]s and reports what changed as
//! [`PlatformNotification`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use input_mapper_core::models::error::CaptureError;
use input_mapper_core::models::notification::PlatformNotification;
use input_mapper_core::traits::notification_source::{NotificationListener, NotificationSource};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Input devices present at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    default_id: Option<String>,
    device_ids: Vec<String>,
}

impl DeviceSnapshot {
    pub fn new(default_id: Option<String>, mut device_ids: Vec<String>) -> Self {
        device_ids.sort();
        device_ids.dedup();
        Self { default_id, device_ids }
    }

    pub fn default_id(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    /// Notifications describing the move from `previous` to `self`.
    pub fn changes_since(&self, previous: &DeviceSnapshot) -> Vec<PlatformNotification> {
        let mut changes = Vec::new();
        if self.device_ids != previous.device_ids {
            changes.push(PlatformNotification::DeviceListChanged);
        }
        if self.default_id != previous.default_id {
            changes.push(PlatformNotification::DefaultDeviceChanged);
        }
        changes
    }
}

pub type SnapshotProbe = Arc<dyn Fn() -> Result<DeviceSnapshot, CaptureError> + Send + Sync + 'static>;

/// [`NotificationSource`] that polls a snapshot probe on a
/// `device-watcher` thread.
pub struct DeviceWatcher {
    poll_interval: Duration,
    probe: SnapshotProbe,
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl DeviceWatcher {
    pub fn new(poll_interval: Duration, probe: SnapshotProbe) -> Result<Self, CaptureError> {
        if poll_interval.is_zero() {
            return Err(CaptureError::ConfigurationFailed(
                "poll_interval must be greater than zero".into(),
            ));
        }
        Ok(Self {
            poll_interval,
            probe,
            running: Mutex::new(None),
        })
    }

    /// Watch the WASAPI capture endpoints.
    #[cfg(target_os = "windows")]
    pub fn wasapi(poll_interval: Duration) -> Result<Self, CaptureError> {
        let platform = crate::device_enumerator::WasapiPlatform;
        Self::new(poll_interval, Arc::new(move || platform.snapshot()))
    }
}

impl NotificationSource for DeviceWatcher {
    fn register(&self, listener: NotificationListener) -> Result<(), CaptureError> {
        self.unregister();

        let baseline = (self.probe)()?;
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let probe = Arc::clone(&self.probe);
        let interval = self.poll_interval;

        // Detached; exits within one poll interval of unregister.
        thread::Builder::new()
            .name("device-watcher".into())
            .spawn(move || watch_loop(baseline, probe, listener, thread_running, interval))
            .map_err(|e| CaptureError::Platform(format!("failed to spawn watcher thread: {}", e)))?;

        *self.running.lock() = Some(running);
        log::debug!("Device watcher polling every {:?}", interval);
        Ok(())
    }

    fn unregister(&self) {
        if let Some(running) = self.running.lock().take() {
            running.store(false, Ordering::SeqCst);
            log::debug!("Device watcher stopped");
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn watch_loop(
    mut previous: DeviceSnapshot,
    probe: SnapshotProbe,
    listener: NotificationListener,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut failing = false;
    while running.load(Ordering::SeqCst) {
        thread::sleep(interval);
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let current = match probe() {
            Ok(snapshot) => {
                failing = false;
                snapshot
            }
            Err(e) => {
                if !failing {
                    log::warn!("Device poll failed: {}", e);
                    failing = true;
                }
                continue;
            }
        };

        for notification in current.changes_since(&previous) {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            log::debug!("Device watcher observed {:?}", notification);
            listener(notification);
        }
        previous = current;
    }
}
