/// Windowed audio provider
///
/// Hands the feature engine one fixed-size analysis window per slice: the
/// overlap tail carried from the previous window followed by freshly drained
/// samples.

use super::capture::AudioClock;
use super::ring_buffer::AudioRingBuffer;
use super::AudioSample;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Producer of analysis windows for the feature engine
pub trait AudioSource: Send {
    /// Current position of the audio clock
    fn latest_timestamp_ms(&self) -> u64;

    /// Next analysis window
    ///
    /// `start_ms` and `duration_ms` only label the request; the content is
    /// whatever the capture side has delivered so far.
    fn get_audio_samples(&mut self, start_ms: u64, duration_ms: u64) -> &[AudioSample];
}

/// Ring-buffer backed [`AudioSource`]
pub struct AudioProvider {
    ring: Arc<AudioRingBuffer>,
    clock: Arc<AudioClock>,
    history: Vec<AudioSample>,
    output: Vec<AudioSample>,
    scratch: Vec<u8>,
    new_samples: usize,
    read_timeout: Duration,
    short_reads: u64,
}

impl AudioProvider {
    /// `history_samples` of overlap plus `new_samples` fresh samples per window
    pub fn new(
        ring: Arc<AudioRingBuffer>,
        clock: Arc<AudioClock>,
        history_samples: usize,
        new_samples: usize,
        read_timeout: Duration,
    ) -> Self {
        debug!(
            "Audio provider: {} history + {} new samples per window",
            history_samples, new_samples
        );

        Self {
            ring,
            clock,
            history: vec![0; history_samples],
            output: vec![0; history_samples + new_samples],
            scratch: vec![0; new_samples * 2],
            new_samples,
            read_timeout,
            short_reads: 0,
        }
    }

    /// Windows that had to be padded with silence
    pub fn short_reads(&self) -> u64 {
        self.short_reads
    }

    pub fn window_len(&self) -> usize {
        self.output.len()
    }
}

impl AudioSource for AudioProvider {
    fn latest_timestamp_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn get_audio_samples(&mut self, start_ms: u64, duration_ms: u64) -> &[AudioSample] {
        let keep = self.history.len();

        let read = self.ring.read(&mut self.scratch, self.read_timeout);
        let got = read / 2;

        if got < self.new_samples {
            self.short_reads += 1;
            debug!(
                "Window at {}ms ({}ms): {} of {} samples available, padding with silence",
                start_ms, duration_ms, got, self.new_samples
            );
        } else {
            trace!("Window at {}ms ({}ms)", start_ms, duration_ms);
        }

        self.output[..keep].copy_from_slice(&self.history);

        for (slot, bytes) in self.output[keep..].iter_mut().zip(self.scratch[..got * 2].chunks_exact(2)) {
            *slot = AudioSample::from_le_bytes([bytes[0], bytes[1]]);
        }
        self.output[keep + got..].fill(0);

        let total = self.output.len();
        self.history.copy_from_slice(&self.output[total - keep..]);

        &self.output
    }
}
