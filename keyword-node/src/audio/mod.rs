/// Audio acquisition
///
/// Byte ring buffer shared between the capture thread and the feature
/// engine, the capture task that fills it, and the windowed sample
/// provider that drains it.

pub mod capture;
pub mod provider;
pub mod ring_buffer;

pub use capture::{
    AudioClock, CaptureConfig, CaptureError, CaptureTask, CaptureWorker, Microphone, WavMicrophone,
};
#[cfg(feature = "mic")]
pub use capture::CpalMicrophone;
pub use provider::{AudioProvider, AudioSource};
pub use ring_buffer::{AudioRingBuffer, RingBufferError};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Fixed-length run of samples tagged with the audio clock (milliseconds)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub timestamp_ms: u64,
    pub samples: Vec<AudioSample>,
}

impl AudioFrame {
    pub fn new(timestamp_ms: u64, samples: Vec<AudioSample>) -> Self {
        Self {
            timestamp_ms,
            samples,
        }
    }

    /// Little-endian PCM bytes, as streamed to the hub
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}
