use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::error::CaptureError;
use crate::models::notification::{PlatformNotification, ReconstructionRequest};
use crate::traits::notification_source::{NotificationListener, NotificationSource};

/// Receives the coalesced signal on the detector thread.
pub type ReconstructionHandler = Arc<dyn Fn(ReconstructionRequest) + Send + Sync + 'static>;

/// How often an idle detector thread rechecks whether it was unsubscribed.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Subscription {
    running: Arc<AtomicBool>,
    // Detached on unsubscribe; the thread exits after any in-flight handler call.
    _handle: thread::JoinHandle<()>,
}

/// Turns raw platform notifications into debounced reconstruction requests.
///
/// The platform listener only forwards into a channel. A dedicated
/// `reconstruction-detector` thread collects each burst until it has been
/// quiet for `debounce_window` (or `max_coalesce_delay` has passed since the
/// burst began), classifies it, and calls the handler.
pub struct ReconstructionDetector {
    source: Arc<dyn NotificationSource>,
    debounce_window: Duration,
    max_coalesce_delay: Duration,
    subscription: Mutex<Option<Subscription>>,
}

impl ReconstructionDetector {
    pub fn new(source: Arc<dyn NotificationSource>, debounce_window: Duration, max_coalesce_delay: Duration) -> Self {
        Self {
            source,
            debounce_window,
            max_coalesce_delay: max_coalesce_delay.max(debounce_window),
            subscription: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn is_subscribed(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Start delivering reconstruction requests to `handler`, replacing any
    /// existing subscription.
    pub fn subscribe(&self, handler: ReconstructionHandler) -> Result<(), CaptureError> {
        self.unsubscribe();

        let (tx, rx) = mpsc::channel::<PlatformNotification>();
        let running = Arc::new(AtomicBool::new(true));

        let listening = Arc::clone(&running);
        let listener: NotificationListener = Arc::new(move |notification| {
            if listening.load(Ordering::SeqCst) {
                // A closed channel means the detector thread is gone.
                let _ = tx.send(notification);
            }
        });

        let thread_running = Arc::clone(&running);
        let window = self.debounce_window;
        let max_delay = self.max_coalesce_delay;
        let handle = thread::Builder::new()
            .name("reconstruction-detector".into())
            .spawn(move || detector_loop(rx, thread_running, handler, window, max_delay))
            .map_err(|e| CaptureError::Platform(format!("failed to spawn detector thread: {}", e)))?;

        if let Err(e) = self.source.register(listener) {
            running.store(false, Ordering::SeqCst);
            log::warn!("Failed to register for audio notifications: {}", e);
            return Err(e);
        }

        *self.subscription.lock() = Some(Subscription {
            running,
            _handle: handle,
        });
        log::debug!(
            "Subscribed to audio notifications (debounce {:?}, max {:?})",
            window,
            max_delay
        );
        Ok(())
    }

    /// Stop delivering requests. Returns without waiting for the detector
    /// thread, so it is safe to call while a handler is running.
    pub fn unsubscribe(&self) {
        let Some(subscription) = self.subscription.lock().take() else {
            return;
        };
        subscription.running.store(false, Ordering::SeqCst);
        self.source.unregister();
        log::debug!("Unsubscribed from audio notifications");
    }
}

impl Drop for ReconstructionDetector {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn detector_loop(
    rx: Receiver<PlatformNotification>,
    running: Arc<AtomicBool>,
    handler: ReconstructionHandler,
    window: Duration,
    max_delay: Duration,
) {
    let mut interrupted = false;
    let mut reported_interrupted = false;

    while running.load(Ordering::SeqCst) {
        let first = match rx.recv_timeout(IDLE_POLL_INTERVAL) {
            Ok(notification) => notification,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let burst = collect_burst(&rx, first, window, max_delay);
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let request = ReconstructionRequest::classify(&burst, interrupted);
        interrupted = request.interrupted;
        if request.interrupted && reported_interrupted {
            log::debug!(
                "Session still interrupted, holding {} notification(s)",
                burst.len()
            );
            continue;
        }
        reported_interrupted = request.interrupted;

        log::debug!(
            "Coalesced {} notification(s) into one reconstruction request (interrupted: {})",
            burst.len(),
            request.interrupted
        );
        handler(request);
    }
}

/// Drain notifications until the channel has been quiet for `window`, or
/// `max_delay` has elapsed since `first` arrived.
fn collect_burst(
    rx: &Receiver<PlatformNotification>,
    first: PlatformNotification,
    window: Duration,
    max_delay: Duration,
) -> Vec<PlatformNotification> {
    let mut burst = vec![first];
    let began = Instant::now();
    loop {
        let elapsed = began.elapsed();
        if elapsed >= max_delay {
            break;
        }
        match rx.recv_timeout(window.min(max_delay - elapsed)) {
            Ok(notification) => burst.push(notification),
            Err(_) => break,
        }
    }
    burst
}
