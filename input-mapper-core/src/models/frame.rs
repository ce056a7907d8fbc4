use std::time::Duration;

/// Bits of the sequence number reserved for the position inside an epoch.
///
/// Every reconstruction starts a new epoch, so delivery resumes at
/// `epoch << SEQUENCE_EPOCH_SHIFT` and the sink always observes a gap.
///
/// An epoch holds 2^32 buffers (about 497 days of 10 ms buffers); past that
/// the position carries into the epoch bits. Epochs wrap modulo 2^32, see
/// [`EPOCH_MASK`].
pub const SEQUENCE_EPOCH_SHIFT: u32 = 32;

/// Epoch numbers are taken modulo 2^32 when forming a sequence origin.
pub const EPOCH_MASK: u64 = (1 << (u64::BITS - SEQUENCE_EPOCH_SHIFT)) - 1;

/// A block of captured audio, handed to the [`FrameSink`](crate::FrameSink) by value.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sequence: u64,
    timestamp: Duration,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sequence: u64, timestamp: Duration, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sequence,
            timestamp,
            sample_rate,
            channels,
        }
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Reconstruction epoch this frame was captured in.
    pub fn epoch(&self) -> u64 {
        self.sequence >> SEQUENCE_EPOCH_SHIFT
    }

    /// Time since the device session opened, as reported by the device.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// A buffer borrowed from the device on the real-time capture thread.
#[derive(Debug, Clone, Copy)]
pub struct RawBuffer<'a> {
    pub samples: &'a [f32],
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: Duration,
    /// The device lost audio between the previous buffer and this one.
    pub discontinuity: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_high_bits_of_sequence() {
        let frame = AudioFrame::new(vec![0.0; 4], (3 << SEQUENCE_EPOCH_SHIFT) + 7, Duration::ZERO, 48000, 2);
        assert_eq!(frame.epoch(), 3);
        assert_eq!(frame.frame_count(), 2);
    }

    #[test]
    fn epoch_mask_covers_high_half() {
        assert_eq!(EPOCH_MASK, u64::from(u32::MAX));
        assert_eq!(EPOCH_MASK << SEQUENCE_EPOCH_SHIFT, u64::MAX << SEQUENCE_EPOCH_SHIFT);
    }
}
