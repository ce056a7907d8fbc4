use crate::models::frame::AudioFrame;

/// Downstream consumer of captured frames.
///
/// Called directly on the real-time capture thread, one frame at a time.
/// Implementations must return quickly without blocking or panicking. A sink
/// that stalls holds up the capture thread itself; the audio the device
/// overwrites meanwhile is reported by the session as a discontinuity and
/// shows up as a sequence gap on the next delivered frame.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: AudioFrame);
}

impl<F> FrameSink for F
where
    F: Fn(AudioFrame) + Send + Sync,
{
    fn deliver(&self, frame: AudioFrame) {
        self(frame)
    }
}
