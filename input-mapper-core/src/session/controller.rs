use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::models::config::CaptureConfiguration;
use crate::models::device::DeviceDescriptor;
use crate::models::error::CaptureError;
use crate::models::frame::{AudioFrame, RawBuffer, EPOCH_MASK, SEQUENCE_EPOCH_SHIFT};
use crate::models::notification::ReconstructionRequest;
use crate::models::report::ReconstructionReport;
use crate::models::state::CaptureState;
use crate::processing::downmix::downmix_to_mono;
use crate::session::detector::{ReconstructionDetector, ReconstructionHandler};
use crate::traits::capture_delegate::CaptureDelegate;
use crate::traits::device_platform::DevicePlatform;
use crate::traits::device_session::{raw_frame_callback, DeviceSession, SessionOptions};
use crate::traits::frame_sink::FrameSink;
use crate::traits::notification_source::NotificationSource;

/// Read-only handle on the "audio chain is being reconstructed" flag.
#[derive(Debug, Clone)]
pub struct ReconstructionIndicator(Arc<AtomicBool>);

impl ReconstructionIndicator {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome slot for a `start()` queued behind a reconstruction.
#[derive(Debug, Default)]
enum PendingStart {
    #[default]
    Idle,
    Waiting,
    Resolved(Result<(), CaptureError>),
}

impl PendingStart {
    fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting)
    }

    fn resolve(&mut self, result: Result<(), CaptureError>) -> bool {
        if self.is_waiting() {
            *self = Self::Resolved(result);
            true
        } else {
            false
        }
    }

    fn take_outcome(&mut self) -> Option<Result<(), CaptureError>> {
        match std::mem::take(self) {
            Self::Resolved(result) => Some(result),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Internal mutable controller state, protected by `parking_lot::Mutex`.
struct ControllerState {
    state: CaptureState,
    descriptor: Option<DeviceDescriptor>,
    reconstructing: bool,
    /// Reconstruction stopped at an interruption and waits for a resume.
    suspended: bool,
    /// Capture should be running once the chain is rebuilt.
    intent_running: bool,
    pending_start: PendingStart,
    last_error: Option<CaptureError>,
    /// Bumped by teardown; a reconstruction cycle that sees it change aborts.
    generation: u64,
    epoch: u64,
    /// The next gate opening starts a new sequence origin.
    resync: bool,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            state: CaptureState::Uninitialized,
            descriptor: None,
            reconstructing: false,
            suspended: false,
            intent_running: false,
            pending_start: PendingStart::Idle,
            last_error: None,
            generation: 0,
            epoch: 0,
            resync: false,
        }
    }

    fn take_origin(&mut self) -> Option<u64> {
        if std::mem::take(&mut self.resync) {
            Some((self.epoch & EPOCH_MASK) << SEQUENCE_EPOCH_SHIFT)
        } else {
            None
        }
    }
}

/// Real-time side of frame delivery.
///
/// The capture thread touches only the atomics and a `try_lock` on `gate`.
/// The control side closes the gate with a blocking lock, which waits out a
/// delivery in flight; once it returns no further frame reaches the sink.
struct FrameDelivery {
    accepting: AtomicBool,
    next_sequence: AtomicU64,
    dropped: AtomicU64,
    gate: Mutex<bool>,
}

impl FrameDelivery {
    fn new() -> Self {
        Self {
            accepting: AtomicBool::new(false),
            next_sequence: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            gate: Mutex::new(false),
        }
    }

    fn close(&self) {
        let mut open = self.gate.lock();
        self.accepting.store(false, Ordering::SeqCst);
        *open = false;
    }

    fn open(&self, origin: Option<u64>) {
        let mut open = self.gate.lock();
        if let Some(origin) = origin {
            self.next_sequence.store(origin, Ordering::SeqCst);
        }
        *open = true;
        self.accepting.store(true, Ordering::SeqCst);
    }
}

struct Shared<P: DevicePlatform, S: DeviceSession> {
    config: CaptureConfiguration,
    platform: Arc<P>,
    session: Arc<S>,
    sink: Arc<dyn FrameSink>,
    delegate: Mutex<Option<Arc<dyn CaptureDelegate>>>,
    /// Serializes whole control operations and reconstruction cycles.
    /// Held across device calls; never taken by teardown.
    control: Mutex<()>,
    inner: Mutex<ControllerState>,
    /// Signalled whenever a queued start may have been resolved.
    resolved: Condvar,
    reconstructing: Arc<AtomicBool>,
    delivery: FrameDelivery,
}

/// Owns the capture device connection and keeps it alive across audio chain
/// reconstruction.
///
/// ```text
/// [DeviceSession] → (rt thread) → gate → [FrameSink]
/// [NotificationSource] → [ReconstructionDetector] → (detector thread) → reconstruct
/// ```
///
/// One control call at a time is assumed (`setup`, `start`, `stop`,
/// `tear_down`), except that `start()` may block while queued behind a
/// reconstruction. Delegate callbacks must not call back into the controller.
pub struct CaptureController<P: DevicePlatform + 'static, S: DeviceSession + 'static> {
    shared: Arc<Shared<P, S>>,
    detector: ReconstructionDetector,
}

impl<P: DevicePlatform + 'static, S: DeviceSession + 'static> CaptureController<P, S> {
    pub fn new(
        platform: Arc<P>,
        session: Arc<S>,
        notifications: Arc<dyn NotificationSource>,
        sink: Arc<dyn FrameSink>,
        config: CaptureConfiguration,
    ) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;

        let detector = ReconstructionDetector::new(notifications, config.debounce_window, config.max_coalesce_delay);
        let shared = Arc::new(Shared {
            config,
            platform,
            session,
            sink,
            delegate: Mutex::new(None),
            control: Mutex::new(()),
            inner: Mutex::new(ControllerState::new()),
            resolved: Condvar::new(),
            reconstructing: Arc::new(AtomicBool::new(false)),
            delivery: FrameDelivery::new(),
        });

        let weak = Arc::downgrade(&shared);
        shared.session.on_frame(raw_frame_callback(move |buffer| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_buffer(buffer);
            }
        }));

        Ok(Self { shared, detector })
    }

    pub fn set_delegate(&self, delegate: Arc<dyn CaptureDelegate>) {
        *self.shared.delegate.lock() = Some(delegate);
    }

    /// Whether the audio chain is being rebuilt right now. Observational only.
    pub fn audio_chain_is_being_reconstructed(&self) -> bool {
        self.shared.reconstructing.load(Ordering::SeqCst)
    }

    pub fn reconstruction_indicator(&self) -> ReconstructionIndicator {
        ReconstructionIndicator(Arc::clone(&self.shared.reconstructing))
    }

    /// Acquire a device and subscribe to reconstruction notifications.
    /// Transitions: uninitialized → configured.
    pub fn setup(&self) -> Result<(), CaptureError> {
        let _control = self.shared.control.lock();
        {
            let inner = self.shared.inner.lock();
            match inner.state {
                CaptureState::TornDown => return Err(CaptureError::AlreadyTornDown),
                state if state.is_set_up() => {
                    log::debug!("setup() ignored, already {:?}", state);
                    return Ok(());
                }
                _ => {}
            }
        }

        let descriptor = self
            .shared
            .acquire_descriptor()?
            .ok_or(CaptureError::DeviceUnavailable)?;

        self.detector.subscribe(self.reconstruction_handler())?;

        {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                drop(inner);
                self.detector.unsubscribe();
                return Err(CaptureError::AlreadyTornDown);
            }
            inner.descriptor = Some(descriptor.clone());
            inner.state = CaptureState::Configured;
        }

        log::info!("Capture configured on {}", descriptor);
        self.shared.notify_state(CaptureState::Configured);
        Ok(())
    }

    /// Start delivering frames. Transitions: configured → running.
    ///
    /// While the audio chain is being reconstructed the call is queued and
    /// returns once the reconstruction resolves.
    pub fn start(&self) -> Result<(), CaptureError> {
        {
            let inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                return Err(CaptureError::AlreadyTornDown);
            }
            if inner.reconstructing && matches!(inner.state, CaptureState::Configured | CaptureState::Stopped) {
                return self.shared.queue_start(inner);
            }
        }

        let Some(control) = self.shared.control.try_lock_for(self.shared.config.queued_start_timeout) else {
            return Err(CaptureError::Timeout);
        };

        let inner = self.shared.inner.lock();
        match inner.state {
            CaptureState::TornDown => return Err(CaptureError::AlreadyTornDown),
            CaptureState::Configured | CaptureState::Stopped => {}
            state => {
                return Err(CaptureError::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }
        if inner.reconstructing {
            // Suspended by an interruption; the resume completes the start.
            drop(control);
            return self.shared.queue_start(inner);
        }

        let descriptor = match inner.descriptor.clone() {
            Some(descriptor) => {
                drop(inner);
                descriptor
            }
            None => {
                drop(inner);
                self.shared.reacquire_for_start()?
            }
        };

        if let Err(e) = self.shared.open_session(&descriptor) {
            log::warn!("Failed to start capture on {}: {}", descriptor, e);
            self.shared.inner.lock().last_error = Some(e.clone());
            return Err(e);
        }

        {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                drop(inner);
                self.shared.session.close();
                return Err(CaptureError::AlreadyTornDown);
            }
            inner.state = CaptureState::Running;
            inner.intent_running = true;
            inner.last_error = None;
            let origin = inner.take_origin();
            self.shared.delivery.open(origin);
        }
        drop(control);

        log::info!("Capture started on {}", descriptor);
        self.shared.notify_state(CaptureState::Running);
        Ok(())
    }

    /// Stop delivering frames. Transitions: running → stopping → configured.
    ///
    /// No frame reaches the sink after this returns.
    pub fn stop(&self) -> Result<(), CaptureError> {
        let _control = self.shared.control.lock();
        let mut inner = self.shared.inner.lock();
        match inner.state {
            CaptureState::TornDown => return Err(CaptureError::AlreadyTornDown),
            CaptureState::Uninitialized => {
                return Err(CaptureError::InvalidState {
                    operation: "stop",
                    state: CaptureState::Uninitialized,
                })
            }
            CaptureState::Configured | CaptureState::Stopped | CaptureState::Stopping => {
                inner.intent_running = false;
                log::debug!("stop() ignored, capture not running ({:?})", inner.state);
                return Ok(());
            }
            CaptureState::Running => {}
        }

        inner.state = CaptureState::Stopping;
        inner.intent_running = false;
        self.shared.delivery.close();
        drop(inner);
        self.shared.notify_state(CaptureState::Stopping);

        self.shared.session.close();

        {
            let mut inner = self.shared.inner.lock();
            if inner.state != CaptureState::Stopping {
                return Ok(());
            }
            inner.state = CaptureState::Configured;
        }

        let dropped = self.shared.delivery.dropped.swap(0, Ordering::SeqCst);
        if dropped > 0 {
            log::info!("Capture stopped ({} frame(s) dropped by a busy sink)", dropped);
        } else {
            log::info!("Capture stopped");
        }
        self.shared.notify_state(CaptureState::Configured);
        Ok(())
    }

    /// Release the device and stop listening for notifications. Terminal.
    ///
    /// Never fails and never waits for a reconstruction in flight.
    pub fn tear_down(&self) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = CaptureState::TornDown;
            inner.generation += 1;
            inner.descriptor = None;
            inner.intent_running = false;
            inner.suspended = false;
            self.shared.delivery.close();
            self.shared.set_reconstructing(&mut inner, false);
            inner.pending_start.resolve(Err(CaptureError::AlreadyTornDown));
            self.shared.resolved.notify_all();
        }

        self.shared.session.close();
        self.detector.unsubscribe();

        log::info!("Capture torn down");
        self.shared.notify_state(CaptureState::TornDown);
    }

    fn reconstruction_handler(&self) -> ReconstructionHandler {
        let weak: Weak<Shared<P, S>> = Arc::downgrade(&self.shared);
        Arc::new(move |request| {
            if let Some(shared) = weak.upgrade() {
                shared.reconstruct(request);
            }
        })
    }

    #[cfg(test)]
    fn state(&self) -> CaptureState {
        let inner = self.shared.inner.lock();
        assert_eq!(
            inner.state.holds_descriptor(),
            inner.descriptor.is_some(),
            "descriptor {:?} in state {:?}",
            inner.descriptor,
            inner.state
        );
        inner.state
    }
}

impl<P: DevicePlatform + 'static, S: DeviceSession + 'static> Drop for CaptureController<P, S> {
    fn drop(&mut self) {
        self.tear_down();
    }
}

impl<P: DevicePlatform, S: DeviceSession> Shared<P, S> {
    /// Real-time path. Never blocks.
    fn handle_buffer(&self, buffer: RawBuffer<'_>) {
        let delivery = &self.delivery;
        if !delivery.accepting.load(Ordering::Acquire) {
            return;
        }
        // Audio the device lost consumes one sequence number, so the sink sees a gap.
        let skipped = u64::from(buffer.discontinuity);
        let sequence = delivery.next_sequence.fetch_add(1 + skipped, Ordering::AcqRel) + skipped;
        let Some(open) = delivery.gate.try_lock() else {
            delivery.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if !*open {
            return;
        }

        let (samples, channels) = if self.config.downmix_to_mono && buffer.channels > 1 {
            (downmix_to_mono(buffer.samples, buffer.channels as usize), 1)
        } else {
            (buffer.samples.to_vec(), buffer.channels)
        };
        self.sink.deliver(AudioFrame::new(
            samples,
            sequence,
            buffer.timestamp,
            buffer.sample_rate,
            channels,
        ));
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            voice_processing: self.config.voice_processing,
        }
    }

    fn acquire_descriptor(&self) -> Result<Option<DeviceDescriptor>, CaptureError> {
        self.platform
            .resolve_input_device(self.config.preferred_device_id.as_deref())
    }

    fn open_session(&self, descriptor: &DeviceDescriptor) -> Result<(), CaptureError> {
        self.session
            .open(descriptor, &self.session_options())
            .map_err(|e| {
                // Leave the session closed whatever state the failure left it in.
                self.session.close();
                if e.is_start_failure() {
                    e
                } else {
                    CaptureError::StartFailed(e.to_string())
                }
            })
    }

    /// Re-acquire a device for `start()` from `Stopped`.
    fn reacquire_for_start(&self) -> Result<DeviceDescriptor, CaptureError> {
        let descriptor = match self.acquire_descriptor()? {
            Some(descriptor) => descriptor,
            None => {
                self.inner.lock().last_error = Some(CaptureError::DeviceUnavailable);
                return Err(CaptureError::DeviceUnavailable);
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Err(CaptureError::AlreadyTornDown);
            }
            inner.descriptor = Some(descriptor.clone());
            inner.state = CaptureState::Configured;
        }
        log::info!("Re-acquired {} for start", descriptor);
        self.notify_state(CaptureState::Configured);
        Ok(descriptor)
    }

    /// Park the caller until the running reconstruction resolves its start.
    fn queue_start(&self, mut inner: MutexGuard<'_, ControllerState>) -> Result<(), CaptureError> {
        inner.pending_start = PendingStart::Waiting;
        log::info!("start() queued behind audio chain reconstruction");

        let deadline = Instant::now() + self.config.queued_start_timeout;
        loop {
            if let Some(result) = inner.pending_start.take_outcome() {
                drop(inner);
                if result.is_ok() {
                    log::info!("Queued start completed");
                }
                return result;
            }
            if self.resolved.wait_until(&mut inner, deadline).timed_out() {
                if let Some(result) = inner.pending_start.take_outcome() {
                    return result;
                }
                inner.pending_start = PendingStart::Idle;
                log::warn!("Queued start timed out waiting for reconstruction");
                return Err(CaptureError::Timeout);
            }
        }
    }

    fn set_reconstructing(&self, inner: &mut ControllerState, value: bool) {
        inner.reconstructing = value;
        self.reconstructing.store(value, Ordering::SeqCst);
    }

    /// One reconstruction cycle, run on the detector thread.
    fn reconstruct(&self, request: ReconstructionRequest) {
        let _control = self.control.lock();

        let (generation, previous_state, previous_device) = {
            let mut inner = self.inner.lock();
            if !inner.state.accepts_reconstruction() {
                log::debug!("Reconstruction request ignored in state {:?}", inner.state);
                return;
            }
            if inner.state.is_running() {
                inner.intent_running = true;
            }
            // Gate first so the last frame precedes the flag.
            self.delivery.close();
            self.set_reconstructing(&mut inner, true);
            (inner.generation, inner.state, inner.descriptor.clone())
        };

        let mut report = ReconstructionReport::begin(request, previous_device);
        log::info!(
            "Audio chain reconstruction started ({} notification(s), state {:?})",
            request.counts.total(),
            previous_state
        );
        if let Some(delegate) = self.delegate() {
            delegate.on_reconstruction_started();
        }

        self.session.close();

        if request.interrupted {
            {
                let mut inner = self.inner.lock();
                if inner.generation != generation {
                    return;
                }
                inner.suspended = true;
            }
            log::info!("Audio session interrupted, capture suspended until resume");
            report.suspended = true;
            self.finish_report(report);
            return;
        }

        let acquired = match self.acquire_descriptor() {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::warn!("Device re-acquisition failed: {}", e);
                None
            }
        };

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            log::debug!("Reconstruction aborted by teardown");
            return;
        }
        inner.suspended = false;
        inner.epoch += 1;
        inner.resync = true;

        let Some(descriptor) = acquired else {
            inner.descriptor = None;
            inner.state = CaptureState::Stopped;
            inner.last_error = Some(CaptureError::DeviceUnavailable);
            if inner.pending_start.resolve(Err(CaptureError::DeviceUnavailable)) {
                inner.intent_running = false;
            }
            self.set_reconstructing(&mut inner, false);
            self.resolved.notify_all();
            drop(inner);

            log::warn!("No input device after reconstruction, capture stopped");
            if previous_state != CaptureState::Stopped {
                self.notify_state(CaptureState::Stopped);
            }
            self.notify_error(&CaptureError::DeviceUnavailable);
            report.error = Some(CaptureError::DeviceUnavailable);
            self.finish_report(report);
            return;
        };

        inner.descriptor = Some(descriptor.clone());
        if inner.state == CaptureState::Stopped {
            inner.state = CaptureState::Configured;
        }
        report.new_device = Some(descriptor.clone());
        let restart = inner.intent_running || inner.pending_start.is_waiting();
        if !restart {
            inner.state = CaptureState::Configured;
            self.set_reconstructing(&mut inner, false);
            self.resolved.notify_all();
            drop(inner);

            log::info!("Audio chain rebuilt on {}", descriptor);
            if previous_state != CaptureState::Configured {
                self.notify_state(CaptureState::Configured);
            }
            self.finish_report(report);
            return;
        }
        drop(inner);

        let opened = self.open_session(&descriptor);

        let mut inner = self.inner.lock();
        if inner.generation != generation {
            drop(inner);
            self.session.close();
            log::debug!("Reconstruction aborted by teardown after reopen");
            return;
        }

        // A queued start may have timed out while the session was opening.
        let wanted = inner.intent_running || inner.pending_start.is_waiting();
        let withdrawn = opened.is_ok() && !wanted;

        let new_state = match opened {
            Ok(()) if withdrawn => {
                inner.state = CaptureState::Configured;
                self.set_reconstructing(&mut inner, false);
                CaptureState::Configured
            }
            Ok(()) => {
                inner.state = CaptureState::Running;
                inner.intent_running = true;
                inner.last_error = None;
                inner.pending_start.resolve(Ok(()));
                // Flag first so the first new frame follows it.
                self.set_reconstructing(&mut inner, false);
                let origin = inner.take_origin();
                self.delivery.open(origin);
                report.restarted = true;
                CaptureState::Running
            }
            Err(ref e) => {
                inner.state = CaptureState::Configured;
                inner.last_error = Some(e.clone());
                if inner.pending_start.resolve(Err(e.clone())) {
                    inner.intent_running = false;
                }
                self.set_reconstructing(&mut inner, false);
                report.error = Some(e.clone());
                CaptureState::Configured
            }
        };
        self.resolved.notify_all();
        drop(inner);

        match &opened {
            Ok(()) if withdrawn => {
                self.session.close();
                log::info!("Audio chain rebuilt on {}, queued start withdrawn", descriptor);
            }
            Ok(()) => log::info!("Audio chain rebuilt, capture resumed on {}", descriptor),
            Err(e) => {
                log::warn!("Capture restart on {} failed: {}", descriptor, e);
                self.notify_error(e);
            }
        }
        if new_state != previous_state {
            self.notify_state(new_state);
        }
        self.finish_report(report);
    }

    fn delegate(&self) -> Option<Arc<dyn CaptureDelegate>> {
        self.delegate.lock().clone()
    }

    fn notify_state(&self, state: CaptureState) {
        if let Some(delegate) = self.delegate() {
            delegate.on_state_changed(state);
        }
    }

    fn notify_error(&self, error: &CaptureError) {
        if let Some(delegate) = self.delegate() {
            delegate.on_error(error);
        }
    }

    fn finish_report(&self, report: ReconstructionReport) {
        let report = report.finish();
        if let Some(delegate) = self.delegate() {
            delegate.on_reconstruction_finished(&report);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::models::notification::PlatformNotification::*;
    use crate::testing::{
        builtin_mic, usb_headset, FakeDeviceSession, FakeNotificationSource, FakePlatform, RecordingDelegate,
        RecordingSink,
    };

    const WAIT: Duration = Duration::from_secs(3);

    struct Rig {
        platform: Arc<FakePlatform>,
        session: Arc<FakeDeviceSession>,
        source: Arc<FakeNotificationSource>,
        sink: Arc<RecordingSink>,
        delegate: Arc<RecordingDelegate>,
        controller: CaptureController<FakePlatform, FakeDeviceSession>,
    }

    fn test_config() -> CaptureConfiguration {
        CaptureConfiguration {
            debounce_window: Duration::from_millis(20),
            max_coalesce_delay: Duration::from_millis(200),
            queued_start_timeout: Duration::from_secs(3),
            ..Default::default()
        }
    }

    fn rig_with(platform: Arc<FakePlatform>, config: CaptureConfiguration) -> Rig {
        let session = FakeDeviceSession::new();
        let source = FakeNotificationSource::new();
        let sink = RecordingSink::new();
        let delegate = RecordingDelegate::new();
        let controller = CaptureController::new(
            platform.clone(),
            session.clone(),
            source.clone(),
            sink.clone(),
            config,
        )
        .unwrap();
        controller.set_delegate(delegate.clone());
        sink.watch(controller.reconstruction_indicator());
        Rig {
            platform,
            session,
            source,
            sink,
            delegate,
            controller,
        }
    }

    fn rig() -> Rig {
        rig_with(FakePlatform::with_device(builtin_mic()), test_config())
    }

    fn emit_frames(session: &FakeDeviceSession, count: usize) {
        for _ in 0..count {
            assert!(session.emit(480));
        }
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = CaptureConfiguration {
            debounce_window: Duration::ZERO,
            ..Default::default()
        };
        let result = CaptureController::new(
            FakePlatform::new(),
            FakeDeviceSession::new(),
            FakeNotificationSource::new(),
            RecordingSink::new(),
            config,
        );
        assert!(matches!(result, Err(CaptureError::ConfigurationFailed(_))));
    }

    #[test]
    fn setup_without_device_fails_then_succeeds_once_device_appears() {
        let r = rig_with(FakePlatform::new(), test_config());

        assert_eq!(r.controller.setup(), Err(CaptureError::DeviceUnavailable));
        assert_eq!(r.controller.state(), CaptureState::Uninitialized);
        assert!(!r.source.is_registered());

        r.platform.add_device(builtin_mic());
        r.platform.set_default(Some("builtin"));
        assert_eq!(r.controller.setup(), Ok(()));
        assert_eq!(r.controller.state(), CaptureState::Configured);
        assert!(r.source.is_registered());
    }

    #[test]
    fn setup_is_idempotent_once_configured() {
        let r = rig();
        r.controller.setup().unwrap();
        let queries = r.platform.default_queries();

        assert_eq!(r.controller.setup(), Ok(()));
        r.controller.start().unwrap();
        assert_eq!(r.controller.setup(), Ok(()));

        assert_eq!(r.platform.default_queries(), queries);
        assert_eq!(r.source.registrations(), 1);
        assert_eq!(r.controller.state(), CaptureState::Running);
    }

    #[test]
    fn setup_prefers_configured_device_when_present() {
        let platform = FakePlatform::with_device(builtin_mic());
        platform.add_device(usb_headset());
        let config = CaptureConfiguration {
            preferred_device_id: Some("usb-headset".into()),
            voice_processing: true,
            ..test_config()
        };
        let r = rig_with(platform, config);

        r.controller.setup().unwrap();
        r.controller.start().unwrap();
        assert_eq!(r.session.last_device(), Some(usb_headset()));
        assert!(r.session.last_options().voice_processing);
    }

    #[test]
    fn operations_before_setup_are_rejected() {
        let r = rig();
        assert_eq!(
            r.controller.start(),
            Err(CaptureError::InvalidState {
                operation: "start",
                state: CaptureState::Uninitialized,
            })
        );
        assert!(matches!(r.controller.stop(), Err(CaptureError::InvalidState { .. })));
        assert_eq!(r.controller.state(), CaptureState::Uninitialized);
    }

    #[test]
    fn start_twice_is_rejected_and_stop_when_configured_is_noop() {
        let r = rig();
        r.controller.setup().unwrap();
        assert_eq!(r.controller.stop(), Ok(()));
        assert_eq!(r.controller.state(), CaptureState::Configured);

        r.controller.start().unwrap();
        assert!(matches!(
            r.controller.start(),
            Err(CaptureError::InvalidState {
                state: CaptureState::Running,
                ..
            })
        ));
        assert_eq!(r.session.opens(), 1);
    }

    #[test]
    fn frames_are_delivered_with_consecutive_sequence_numbers() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        emit_frames(&r.session, 10);

        assert_eq!(r.sink.sequences(), (0..10).collect::<Vec<_>>());
        let frames = r.sink.frames();
        assert_eq!(frames[0].sample_rate(), 48_000);
        assert_eq!(frames[0].frame_count(), 480);
        approx::assert_relative_eq!(frames[1].timestamp().as_secs_f64(), 0.01, epsilon = 1e-9);
    }

    #[test]
    fn no_frames_delivered_after_stop_returns() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();
        emit_frames(&r.session, 3);

        r.controller.stop().unwrap();
        assert!(!r.session.is_open());
        assert!(r.session.emit_stale(480));

        assert_eq!(r.sink.len(), 3);
        assert_eq!(r.controller.state(), CaptureState::Configured);
        assert_eq!(
            r.delegate.states(),
            vec![
                CaptureState::Configured,
                CaptureState::Running,
                CaptureState::Stopping,
                CaptureState::Configured,
            ]
        );
    }

    #[test]
    fn start_failure_leaves_controller_configured() {
        let r = rig();
        r.controller.setup().unwrap();

        r.session.fail_opens(Some(CaptureError::DeviceBusy));
        assert_eq!(r.controller.start(), Err(CaptureError::DeviceBusy));
        assert_eq!(r.controller.state(), CaptureState::Configured);

        r.session.fail_opens(Some(CaptureError::Platform("driver fault".into())));
        assert!(matches!(r.controller.start(), Err(CaptureError::StartFailed(_))));

        r.session.fail_opens(None);
        assert_eq!(r.controller.start(), Ok(()));
        assert_eq!(r.controller.state(), CaptureState::Running);
    }

    #[test]
    fn device_change_rebuilds_chain_and_resyncs_sequence() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();
        emit_frames(&r.session, 10);

        r.platform.add_device(usb_headset());
        r.platform.set_default(Some("usb-headset"));
        r.source.emit(DefaultDeviceChanged);
        assert!(r.delegate.wait_for_reports(1, WAIT));

        let report = &r.delegate.reports()[0];
        assert_eq!(report.previous_device, Some(builtin_mic()));
        assert_eq!(report.new_device, Some(usb_headset()));
        assert!(report.restarted);
        assert!(report.device_changed());
        assert!(!r.controller.audio_chain_is_being_reconstructed());
        assert_eq!(r.controller.state(), CaptureState::Running);
        assert_eq!(r.session.last_device(), Some(usb_headset()));

        emit_frames(&r.session, 5);
        let sequences = r.sink.sequences();
        assert_eq!(sequences.len(), 15);
        let gaps = sequences.windows(2).filter(|w| w[1] != w[0] + 1).count();
        assert_eq!(gaps, 1);
        assert!(sequences.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(sequences[10], 1 << SEQUENCE_EPOCH_SHIFT);
        assert_eq!(r.sink.frames()[10].sample_rate(), 44_100);
        assert_eq!(r.sink.deliveries_during_reconstruction(), 0);

        r.controller.stop().unwrap();
        r.controller.tear_down();
        assert_eq!(r.controller.setup(), Err(CaptureError::AlreadyTornDown));
        assert_eq!(r.controller.start(), Err(CaptureError::AlreadyTornDown));
        assert_eq!(r.controller.stop(), Err(CaptureError::AlreadyTornDown));
        r.controller.tear_down();
        assert_eq!(r.controller.state(), CaptureState::TornDown);
        assert!(!r.source.is_registered());
    }

    #[test]
    fn notification_burst_triggers_one_reacquisition() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();
        let queries = r.platform.default_queries();

        for _ in 0..6 {
            r.source.emit(DeviceListChanged);
        }
        assert!(r.delegate.wait_for_reports(1, WAIT));
        thread::sleep(Duration::from_millis(150));

        assert_eq!(r.delegate.reports().len(), 1);
        assert_eq!(r.delegate.reports()[0].request.counts.total(), 6);
        assert_eq!(r.platform.default_queries(), queries + 1);
        assert_eq!(r.session.opens(), 2);
    }

    #[test]
    fn flag_is_raised_and_frames_held_during_reconstruction() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();
        emit_frames(&r.session, 2);

        r.platform.query_hold.arm();
        r.source.emit(DefaultDeviceChanged);
        assert!(r.platform.query_hold.wait_entered(WAIT));

        assert!(r.controller.audio_chain_is_being_reconstructed());
        assert_eq!(r.controller.state(), CaptureState::Running);
        assert!(!r.session.is_open());
        assert!(r.session.emit_stale(480));
        assert_eq!(r.sink.len(), 2);

        r.platform.query_hold.release();
        assert!(r.delegate.wait_for_reports(1, WAIT));
        assert!(!r.controller.audio_chain_is_being_reconstructed());
        emit_frames(&r.session, 1);
        assert_eq!(r.sink.len(), 3);
        assert_eq!(r.sink.deliveries_during_reconstruction(), 0);
    }

    #[test]
    fn start_during_reconstruction_is_queued_until_it_resolves() {
        let r = rig();
        r.controller.setup().unwrap();

        r.platform.query_hold.arm();
        r.source.emit(DeviceListChanged);
        assert!(r.platform.query_hold.wait_entered(WAIT));
        assert!(r.controller.audio_chain_is_being_reconstructed());

        let Rig {
            platform,
            session,
            delegate,
            controller,
            ..
        } = r;
        thread::scope(|scope| {
            let starter = scope.spawn(|| controller.start());
            thread::sleep(Duration::from_millis(100));
            assert!(!starter.is_finished());

            platform.query_hold.release();
            assert_eq!(starter.join().unwrap(), Ok(()));
        });

        assert_eq!(controller.state(), CaptureState::Running);
        assert!(!controller.audio_chain_is_being_reconstructed());
        assert!(session.is_open());
        assert!(delegate.wait_for_reports(1, WAIT));
        assert!(delegate.reports()[0].restarted);
    }

    #[test]
    fn queued_start_reports_device_unavailable_when_device_vanishes() {
        let r = rig();
        r.controller.setup().unwrap();

        r.platform.query_hold.arm();
        r.source.emit(DeviceListChanged);
        assert!(r.platform.query_hold.wait_entered(WAIT));
        r.platform.remove_device("builtin");

        thread::scope(|scope| {
            let starter = scope.spawn(|| r.controller.start());
            thread::sleep(Duration::from_millis(100));
            r.platform.query_hold.release();
            assert_eq!(starter.join().unwrap(), Err(CaptureError::DeviceUnavailable));
        });

        assert_eq!(r.controller.state(), CaptureState::Stopped);
        assert!(!r.controller.audio_chain_is_being_reconstructed());
        assert!(!r.session.is_open());
    }

    #[test]
    fn lost_device_settles_in_stopped_and_recovers_on_next_signal() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        r.platform.remove_device("builtin");
        r.source.emit(DeviceListChanged);
        assert!(r.delegate.wait_for_reports(1, WAIT));

        assert_eq!(r.controller.state(), CaptureState::Stopped);
        assert_eq!(r.delegate.reports()[0].error, Some(CaptureError::DeviceUnavailable));
        assert_eq!(r.delegate.errors(), vec![CaptureError::DeviceUnavailable]);
        assert!(!r.controller.audio_chain_is_being_reconstructed());
        assert_eq!(r.controller.stop(), Ok(()));

        // stop() cleared the intent to run, so recovery only re-acquires.
        r.platform.add_device(usb_headset());
        r.platform.set_default(Some("usb-headset"));
        r.source.emit(DeviceListChanged);
        assert!(r.delegate.wait_for_reports(2, WAIT));
        assert_eq!(r.controller.state(), CaptureState::Configured);
        assert!(!r.session.is_open());
    }

    #[test]
    fn lost_device_resumes_running_when_it_returns() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        r.platform.remove_device("builtin");
        r.source.emit(DeviceListChanged);
        assert!(r.delegate.wait_for_reports(1, WAIT));
        assert_eq!(r.controller.state(), CaptureState::Stopped);

        r.platform.add_device(builtin_mic());
        r.platform.set_default(Some("builtin"));
        r.source.emit(DeviceListChanged);
        assert!(r.delegate.wait_for_reports(2, WAIT));

        assert_eq!(r.controller.state(), CaptureState::Running);
        assert!(r.session.is_open());
        emit_frames(&r.session, 1);
        assert_eq!(r.sink.len(), 1);
    }

    #[test]
    fn explicit_start_from_stopped_reacquires_device() {
        let r = rig();
        r.controller.setup().unwrap();
        r.platform.remove_device("builtin");
        r.source.emit(DeviceListChanged);
        assert!(r.delegate.wait_for_reports(1, WAIT));
        assert_eq!(r.controller.state(), CaptureState::Stopped);

        assert_eq!(r.controller.start(), Err(CaptureError::DeviceUnavailable));
        assert_eq!(r.controller.state(), CaptureState::Stopped);

        r.platform.add_device(usb_headset());
        r.platform.set_default(Some("usb-headset"));
        assert_eq!(r.controller.start(), Ok(()));
        assert_eq!(r.controller.state(), CaptureState::Running);
        assert_eq!(r.session.last_device(), Some(usb_headset()));
    }

    #[test]
    fn failed_restart_keeps_intent_for_next_signal() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        r.session.fail_opens(Some(CaptureError::DeviceBusy));
        r.source.emit(DefaultDeviceChanged);
        assert!(r.delegate.wait_for_reports(1, WAIT));
        assert_eq!(r.controller.state(), CaptureState::Configured);
        assert_eq!(r.delegate.errors(), vec![CaptureError::DeviceBusy]);

        r.session.fail_opens(None);
        r.source.emit(DefaultDeviceChanged);
        assert!(r.delegate.wait_for_reports(2, WAIT));
        assert_eq!(r.controller.state(), CaptureState::Running);
    }

    #[test]
    fn interruption_suspends_capture_until_resumed() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();
        emit_frames(&r.session, 4);

        r.source.emit(Interrupted);
        assert!(r.delegate.wait_for_reports(1, WAIT));
        assert!(r.delegate.reports()[0].suspended);
        assert!(r.controller.audio_chain_is_being_reconstructed());
        assert!(!r.session.is_open());
        assert_eq!(r.controller.state(), CaptureState::Running);

        r.source.emit(Resumed);
        assert!(r.delegate.wait_for_reports(2, WAIT));
        assert!(!r.controller.audio_chain_is_being_reconstructed());
        assert!(r.session.is_open());

        emit_frames(&r.session, 2);
        let sequences = r.sink.sequences();
        assert_eq!(&sequences[..4], &[0, 1, 2, 3]);
        assert_eq!(sequences[4], 1 << SEQUENCE_EPOCH_SHIFT);
        assert_eq!(r.sink.deliveries_during_reconstruction(), 0);
    }

    #[test]
    fn start_while_interrupted_completes_on_resume() {
        let r = rig();
        r.controller.setup().unwrap();
        r.source.emit(Interrupted);
        assert!(r.delegate.wait_for_reports(1, WAIT));

        thread::scope(|scope| {
            let starter = scope.spawn(|| r.controller.start());
            thread::sleep(Duration::from_millis(100));
            assert!(!starter.is_finished());
            r.source.emit(Resumed);
            assert_eq!(starter.join().unwrap(), Ok(()));
        });
        assert_eq!(r.controller.state(), CaptureState::Running);
    }

    #[test]
    fn queued_start_times_out_when_interruption_lingers() {
        let config = CaptureConfiguration {
            queued_start_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let r = rig_with(FakePlatform::with_device(builtin_mic()), config);
        r.controller.setup().unwrap();
        r.source.emit(Interrupted);
        assert!(r.delegate.wait_for_reports(1, WAIT));

        assert_eq!(r.controller.start(), Err(CaptureError::Timeout));

        // The timed-out start must not be applied on resume.
        r.source.emit(Resumed);
        assert!(r.delegate.wait_for_reports(2, WAIT));
        assert_eq!(r.controller.state(), CaptureState::Configured);
        assert!(!r.session.is_open());
    }

    #[test]
    fn tear_down_during_reconstruction_is_bounded_and_final() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        r.session.open_hold.arm();
        r.source.emit(DefaultDeviceChanged);
        assert!(r.session.open_hold.wait_entered(WAIT));
        assert!(r.controller.audio_chain_is_being_reconstructed());

        let began = Instant::now();
        r.controller.tear_down();
        assert!(began.elapsed() < Duration::from_millis(500));
        assert_eq!(r.controller.state(), CaptureState::TornDown);
        assert!(!r.controller.audio_chain_is_being_reconstructed());

        r.session.open_hold.release();
        thread::sleep(Duration::from_millis(150));
        assert!(!r.session.is_open());
        assert_eq!(r.session.opens(), 1, "the in-flight open must not complete");
        assert_eq!(r.controller.state(), CaptureState::TornDown);
        assert!(r.delegate.reports().is_empty());
        assert_eq!(r.delegate.last_state(), Some(CaptureState::TornDown));
    }

    #[test]
    fn tear_down_releases_a_queued_start() {
        let r = rig();
        r.controller.setup().unwrap();
        r.source.emit(Interrupted);
        assert!(r.delegate.wait_for_reports(1, WAIT));

        thread::scope(|scope| {
            let starter = scope.spawn(|| r.controller.start());
            thread::sleep(Duration::from_millis(100));
            r.controller.tear_down();
            assert_eq!(starter.join().unwrap(), Err(CaptureError::AlreadyTornDown));
        });
    }

    #[test]
    fn reconstruction_in_configured_state_does_not_start_capture() {
        let r = rig();
        r.controller.setup().unwrap();
        r.platform.add_device(usb_headset());
        r.platform.set_default(Some("usb-headset"));

        r.source.emit(DefaultDeviceChanged);
        assert!(r.delegate.wait_for_reports(1, WAIT));
        assert!(!r.delegate.reports()[0].restarted);
        assert_eq!(r.controller.state(), CaptureState::Configured);
        assert_eq!(r.session.opens(), 0);

        r.controller.start().unwrap();
        assert_eq!(r.session.last_device(), Some(usb_headset()));
        emit_frames(&r.session, 1);
        assert_eq!(r.sink.sequences(), vec![1 << SEQUENCE_EPOCH_SHIFT]);
    }

    #[test]
    fn downmixes_multichannel_input_when_configured() {
        let platform = FakePlatform::with_device(usb_headset());
        let config = CaptureConfiguration {
            downmix_to_mono: true,
            ..test_config()
        };
        let r = rig_with(platform, config);
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        emit_frames(&r.session, 1);
        let frame = &r.sink.frames()[0];
        assert_eq!(frame.channels(), 1);
        assert_eq!(frame.samples().len(), 480);
    }

    #[test]
    fn platform_failure_during_reacquisition_counts_as_unavailable() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        r.platform.fail_queries(Some(CaptureError::Platform("enumerator gone".into())));
        r.source.emit(DefaultDeviceChanged);
        assert!(r.delegate.wait_for_reports(1, WAIT));

        assert_eq!(r.delegate.reconstructions_started(), 1);
        assert_eq!(r.controller.state(), CaptureState::Stopped);
        assert_eq!(r.delegate.reports()[0].error, Some(CaptureError::DeviceUnavailable));
        assert_eq!(r.session.closes(), 1);
        assert!(r.sink.is_empty());
    }

    #[test]
    fn start_that_times_out_during_reopen_is_withdrawn() {
        let config = CaptureConfiguration {
            queued_start_timeout: Duration::from_millis(300),
            ..test_config()
        };
        let r = rig_with(FakePlatform::with_device(builtin_mic()), config);
        r.controller.setup().unwrap();

        r.platform.query_hold.arm();
        r.session.open_hold.arm();
        r.source.emit(DeviceListChanged);
        assert!(r.platform.query_hold.wait_entered(WAIT));

        thread::scope(|scope| {
            let starter = scope.spawn(|| r.controller.start());
            thread::sleep(Duration::from_millis(50));
            r.platform.query_hold.release();
            assert!(r.session.open_hold.wait_entered(WAIT));

            assert_eq!(starter.join().unwrap(), Err(CaptureError::Timeout));
            r.session.open_hold.release();
        });

        assert!(r.delegate.wait_for_reports(1, WAIT));
        assert!(!r.delegate.reports()[0].restarted);
        assert_eq!(r.controller.state(), CaptureState::Configured);
        assert!(!r.session.is_open());
        assert!(!r.controller.audio_chain_is_being_reconstructed());
        assert!(r.session.emit_stale(480));
        assert!(r.sink.is_empty());
    }

    #[test]
    fn restart_from_stopped_holds_descriptor_while_reopening() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        r.platform.remove_device("builtin");
        r.source.emit(DeviceListChanged);
        assert!(r.delegate.wait_for_reports(1, WAIT));
        assert_eq!(r.controller.state(), CaptureState::Stopped);

        r.platform.add_device(usb_headset());
        r.platform.set_default(Some("usb-headset"));
        r.session.open_hold.arm();
        r.source.emit(DeviceListChanged);
        assert!(r.session.open_hold.wait_entered(WAIT));

        // state() also checks the descriptor matches the state.
        assert_eq!(r.controller.state(), CaptureState::Configured);

        r.session.open_hold.release();
        assert!(r.delegate.wait_for_reports(2, WAIT));
        assert_eq!(r.controller.state(), CaptureState::Running);
    }

    #[test]
    fn device_overrun_shows_as_one_gap() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();

        emit_frames(&r.session, 3);
        assert!(r.session.emit_after_overrun(480));
        emit_frames(&r.session, 2);

        assert_eq!(r.sink.sequences(), vec![0, 1, 2, 4, 5, 6]);
    }

    #[test]
    fn frame_racing_gate_transition_is_dropped_with_gap() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();
        emit_frames(&r.session, 2);

        {
            // Held as the control side does while closing or opening the gate.
            let _gate = r.controller.shared.delivery.gate.lock();
            assert!(r.session.emit(480));
        }
        emit_frames(&r.session, 1);

        assert_eq!(r.sink.sequences(), vec![0, 1, 3]);
        assert_eq!(r.controller.shared.delivery.dropped.load(Ordering::SeqCst), 1);
        r.controller.stop().unwrap();
        assert_eq!(r.controller.shared.delivery.dropped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sequence_origin_wraps_epoch_modulo_mask() {
        let mut inner = ControllerState::new();
        assert_eq!(inner.take_origin(), None);

        inner.epoch = EPOCH_MASK + 4;
        inner.resync = true;
        assert_eq!(inner.take_origin(), Some(3 << SEQUENCE_EPOCH_SHIFT));
        assert_eq!(inner.take_origin(), None);
    }

    #[test]
    fn dropping_controller_tears_down() {
        let r = rig();
        r.controller.setup().unwrap();
        r.controller.start().unwrap();
        let Rig {
            session,
            source,
            controller,
            ..
        } = r;

        drop(controller);
        assert!(!session.is_open());
        assert!(!source.is_registered());
    }
}
