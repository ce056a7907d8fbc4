//! Deterministic fake collaborators for exercising the controller without
//! an audio subsystem.
//!
//! Compiled for this crate's tests and, with the `testing` feature, for
//! backends and hosts that want the same fakes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::models::device::DeviceDescriptor;
use crate::models::error::CaptureError;
use crate::models::frame::{AudioFrame, RawBuffer};
use crate::models::notification::PlatformNotification;
use crate::models::report::ReconstructionReport;
use crate::models::state::CaptureState;
use crate::session::controller::ReconstructionIndicator;
use crate::traits::capture_delegate::CaptureDelegate;
use crate::traits::device_platform::DevicePlatform;
use crate::traits::device_session::{DeviceSession, RawFrameCallback, SessionOptions};
use crate::traits::frame_sink::FrameSink;
use crate::traits::notification_source::{NotificationListener, NotificationSource};

/// A checkpoint a fake can be parked at until the test releases it.
#[derive(Default)]
pub struct Hold {
    state: Mutex<HoldState>,
    changed: Condvar,
}

#[derive(Default)]
struct HoldState {
    armed: bool,
    entered: bool,
    released: bool,
}

impl Hold {
    /// Park the next caller of [`pass`](Self::pass).
    pub fn arm(&self) {
        let mut s = self.state.lock();
        *s = HoldState {
            armed: true,
            entered: false,
            released: false,
        };
    }

    pub fn release(&self) {
        let mut s = self.state.lock();
        s.released = true;
        self.changed.notify_all();
    }

    /// Wait until a caller is parked. Returns false on timeout.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut s = self.state.lock();
        while !s.entered {
            if self.changed.wait_until(&mut s, deadline).timed_out() {
                return s.entered;
            }
        }
        true
    }

    /// Called by the fake; blocks while armed and not released.
    pub fn pass(&self) {
        let mut s = self.state.lock();
        if !s.armed {
            return;
        }
        s.entered = true;
        self.changed.notify_all();
        while !s.released {
            self.changed.wait(&mut s);
        }
        s.armed = false;
    }
}

/// Device list and default device under test control.
#[derive(Default)]
pub struct FakePlatform {
    devices: Mutex<Vec<DeviceDescriptor>>,
    default_id: Mutex<Option<String>>,
    failure: Mutex<Option<CaptureError>>,
    default_queries: AtomicUsize,
    pub query_hold: Hold,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A platform whose only device is `device`, which is also the default.
    pub fn with_device(device: DeviceDescriptor) -> Arc<Self> {
        let platform = Self::new();
        platform.add_device(device.clone());
        platform.set_default(Some(&device.id));
        platform
    }

    pub fn add_device(&self, device: DeviceDescriptor) {
        self.devices.lock().push(device);
    }

    pub fn remove_device(&self, id: &str) {
        self.devices.lock().retain(|d| d.id != id);
        let mut default_id = self.default_id.lock();
        if default_id.as_deref() == Some(id) {
            *default_id = None;
        }
    }

    pub fn set_default(&self, id: Option<&str>) {
        *self.default_id.lock() = id.map(str::to_string);
    }

    /// Make every query fail with `error` until cleared.
    pub fn fail_queries(&self, error: Option<CaptureError>) {
        *self.failure.lock() = error;
    }

    /// How many times the default device has been queried.
    pub fn default_queries(&self) -> usize {
        self.default_queries.load(Ordering::SeqCst)
    }
}

impl DevicePlatform for FakePlatform {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(self.devices.lock().clone())
    }

    fn default_input_device(&self) -> Result<Option<DeviceDescriptor>, CaptureError> {
        self.default_queries.fetch_add(1, Ordering::SeqCst);
        self.query_hold.pass();
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        let Some(id) = self.default_id.lock().clone() else {
            return Ok(None);
        };
        Ok(self.devices.lock().iter().find(|d| d.id == id).cloned())
    }
}

#[derive(Default)]
struct FakeSessionInner {
    callback: Option<RawFrameCallback>,
    device: Option<DeviceDescriptor>,
    options: SessionOptions,
    /// An `open` is between its start and its hold.
    opening: bool,
    frames_emitted: u64,
    last_device: Option<DeviceDescriptor>,
    open_failure: Option<CaptureError>,
    opens: usize,
    closes: usize,
}

/// Session driven by explicit [`emit`](Self::emit) calls instead of hardware.
#[derive(Default)]
pub struct FakeDeviceSession {
    inner: Mutex<FakeSessionInner>,
    pub open_hold: Hold,
}

impl FakeDeviceSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every open fail with `error` until cleared.
    pub fn fail_opens(&self, error: Option<CaptureError>) {
        self.inner.lock().open_failure = error;
    }

    pub fn opens(&self) -> usize {
        self.inner.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.inner.lock().closes
    }

    /// The device of the most recent successful open.
    pub fn last_device(&self) -> Option<DeviceDescriptor> {
        self.inner.lock().last_device.clone()
    }

    pub fn last_options(&self) -> SessionOptions {
        self.inner.lock().options
    }

    /// Produce one buffer of `frames` sample frames if the session is open.
    /// Returns whether a buffer was produced.
    pub fn emit(&self, frames: usize) -> bool {
        self.emit_inner(frames, false, false)
    }

    /// Produce a buffer flagged as following lost audio, like a device
    /// overrun while the capture thread was stalled.
    pub fn emit_after_overrun(&self, frames: usize) -> bool {
        self.emit_inner(frames, false, true)
    }

    /// Produce a buffer even if closed, like a late hardware callback
    /// racing `close`.
    pub fn emit_stale(&self, frames: usize) -> bool {
        self.emit_inner(frames, true, false)
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().device.is_some()
    }

    fn emit_inner(&self, frames: usize, ignore_closed: bool, discontinuity: bool) -> bool {
        let (callback, device, offset) = {
            let mut s = self.inner.lock();
            let device = match (s.device.clone(), ignore_closed) {
                (Some(d), _) => d,
                (None, true) => match s.last_device.clone() {
                    Some(d) => d,
                    None => return false,
                },
                (None, false) => return false,
            };
            let Some(callback) = s.callback.clone() else {
                return false;
            };
            let offset = s.frames_emitted;
            s.frames_emitted += frames as u64;
            (callback, device, offset)
        };

        let channels = device.channels.max(1) as usize;
        let samples: Vec<f32> = (0..frames * channels)
            .map(|i| ((offset as usize * channels + i) % 100) as f32 / 100.0)
            .collect();
        let timestamp = Duration::from_secs_f64(offset as f64 / device.sample_rate as f64);
        callback(RawBuffer {
            samples: &samples,
            sample_rate: device.sample_rate,
            channels: device.channels,
            timestamp,
            discontinuity,
        });
        true
    }
}

impl DeviceSession for FakeDeviceSession {
    fn on_frame(&self, callback: RawFrameCallback) {
        self.inner.lock().callback = Some(callback);
    }

    fn open(&self, descriptor: &DeviceDescriptor, options: &SessionOptions) -> Result<(), CaptureError> {
        self.inner.lock().opening = true;
        // Parked without the lock, so `close` can run meanwhile.
        self.open_hold.pass();
        let mut s = self.inner.lock();
        if !std::mem::take(&mut s.opening) {
            return Err(CaptureError::StartFailed("session closed while opening".into()));
        }
        if let Some(error) = s.open_failure.clone() {
            return Err(error);
        }
        s.opens += 1;
        s.device = Some(descriptor.clone());
        s.last_device = Some(descriptor.clone());
        s.options = *options;
        s.frames_emitted = 0;
        Ok(())
    }

    fn close(&self) {
        let mut s = self.inner.lock();
        s.opening = false;
        if s.device.take().is_some() {
            s.closes += 1;
        }
    }
}

/// Notification source the test emits into by hand.
#[derive(Default)]
pub struct FakeNotificationSource {
    listener: Mutex<Option<NotificationListener>>,
    register_failure: Mutex<Option<CaptureError>>,
    registrations: AtomicUsize,
}

impl FakeNotificationSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_registration(&self, error: Option<CaptureError>) {
        *self.register_failure.lock() = error;
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Deliver `notification` to the registered listener, if any.
    pub fn emit(&self, notification: PlatformNotification) -> bool {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => {
                listener(notification);
                true
            }
            None => false,
        }
    }
}

impl NotificationSource for FakeNotificationSource {
    fn register(&self, listener: NotificationListener) -> Result<(), CaptureError> {
        if let Some(error) = self.register_failure.lock().clone() {
            return Err(error);
        }
        self.registrations.fetch_add(1, Ordering::SeqCst);
        *self.listener.lock() = Some(listener);
        Ok(())
    }

    fn unregister(&self) {
        self.listener.lock().take();
    }
}

/// Sink that keeps every frame and counts deliveries made while the
/// reconstruction indicator was raised.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<AudioFrame>>,
    indicator: Mutex<Option<ReconstructionIndicator>>,
    deliveries_during_reconstruction: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn watch(&self, indicator: ReconstructionIndicator) {
        *self.indicator.lock() = Some(indicator);
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        self.frames.lock().clone()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.frames.lock().iter().map(AudioFrame::sequence).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deliveries_during_reconstruction(&self) -> usize {
        self.deliveries_during_reconstruction.load(Ordering::SeqCst)
    }
}

impl FrameSink for RecordingSink {
    fn deliver(&self, frame: AudioFrame) {
        let reconstructing = self
            .indicator
            .lock()
            .as_ref()
            .is_some_and(ReconstructionIndicator::is_set);
        if reconstructing {
            self.deliveries_during_reconstruction.fetch_add(1, Ordering::SeqCst);
        }
        self.frames.lock().push(frame);
    }
}

#[derive(Default)]
struct DelegateLog {
    states: Vec<CaptureState>,
    started: usize,
    reports: Vec<ReconstructionReport>,
    errors: Vec<CaptureError>,
}

/// Delegate that records every event and lets tests wait for reports.
#[derive(Default)]
pub struct RecordingDelegate {
    log: Mutex<DelegateLog>,
    changed: Condvar,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<CaptureState> {
        self.log.lock().states.clone()
    }

    pub fn last_state(&self) -> Option<CaptureState> {
        self.log.lock().states.last().copied()
    }

    pub fn reconstructions_started(&self) -> usize {
        self.log.lock().started
    }

    pub fn reports(&self) -> Vec<ReconstructionReport> {
        self.log.lock().reports.clone()
    }

    pub fn errors(&self) -> Vec<CaptureError> {
        self.log.lock().errors.clone()
    }

    /// Wait until at least `count` reconstruction reports arrived.
    pub fn wait_for_reports(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut log = self.log.lock();
        while log.reports.len() < count {
            if self.changed.wait_until(&mut log, deadline).timed_out() {
                return log.reports.len() >= count;
            }
        }
        true
    }
}

impl CaptureDelegate for RecordingDelegate {
    fn on_state_changed(&self, state: CaptureState) {
        self.log.lock().states.push(state);
    }

    fn on_reconstruction_started(&self) {
        self.log.lock().started += 1;
    }

    fn on_reconstruction_finished(&self, report: &ReconstructionReport) {
        self.log.lock().reports.push(report.clone());
        self.changed.notify_all();
    }

    fn on_error(&self, error: &CaptureError) {
        self.log.lock().errors.push(error.clone());
    }
}

/// Two ready-made descriptors for device-swap scenarios.
pub fn builtin_mic() -> DeviceDescriptor {
    DeviceDescriptor::new("builtin", "Built-in Microphone", 48_000, 1)
}

pub fn usb_headset() -> DeviceDescriptor {
    DeviceDescriptor::new("usb-headset", "USB Headset", 44_100, 2)
}
