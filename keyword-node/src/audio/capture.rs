/// Audio capture task
///
/// Pulls fixed-size PCM blocks from a microphone, keeps one channel, and
/// pushes the little-endian bytes into the shared ring buffer while
/// advancing the audio clock.

use super::ring_buffer::AudioRingBuffer;
use super::AudioSample;
use cache_padded::CachePadded;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Microphone read failed: {0}")]
    Read(String),

    #[error("Audio device unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid capture configuration: {0}")]
    InvalidConfig(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Monotonic audio clock driven by the number of samples captured
///
/// Milliseconds are derived from the running sample total, so truncation
/// never accumulates across blocks.
#[derive(Debug)]
pub struct AudioClock {
    samples: CachePadded<AtomicU64>,
    sample_rate: u32,
}

impl AudioClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: CachePadded::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    /// Account for `samples` newly written mono samples
    pub fn advance(&self, samples: usize) {
        self.samples.fetch_add(samples as u64, Ordering::Release);
    }

    pub fn total_samples(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }

    pub fn now_ms(&self) -> u64 {
        self.total_samples() * 1000 / self.sample_rate.max(1) as u64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Capture parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Interleaved channels delivered by the microphone
    pub channels: u16,

    /// Channel kept when the microphone is multi-channel
    pub channel_select: u16,

    /// Frames requested from the microphone per read
    pub block_samples: usize,

    /// Ring buffer size in bytes (two bytes per sample)
    pub ring_capacity_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            channel_select: 0,
            block_samples: 800,            // 50ms at 16kHz
            ring_capacity_bytes: super::ring_buffer::DEFAULT_CAPACITY_BYTES,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.sample_rate == 0 {
            return Err(CaptureError::InvalidConfig(
                "sample_rate must be greater than 0".to_string()
            ));
        }

        if self.channels == 0 || self.channel_select >= self.channels {
            return Err(CaptureError::InvalidConfig(format!(
                "channel_select {} out of range for {} channels",
                self.channel_select, self.channels
            )));
        }

        if self.block_samples == 0 {
            return Err(CaptureError::InvalidConfig(
                "block_samples must be greater than 0".to_string()
            ));
        }

        if self.ring_capacity_bytes == 0 || self.ring_capacity_bytes % 2 != 0 {
            return Err(CaptureError::InvalidConfig(
                "ring_capacity_bytes must be a positive even number".to_string()
            ));
        }

        Ok(())
    }

    /// Wall-clock length of one block
    pub fn block_duration(&self) -> Duration {
        Duration::from_micros(self.block_samples as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

/// Source of interleaved PCM blocks
pub trait Microphone: Send {
    /// Fill `buf` with interleaved samples, returning how many were written
    ///
    /// `Ok(0)` means no audio is available right now.
    fn read_block(&mut self, buf: &mut [AudioSample]) -> Result<usize, CaptureError>;
}

/// One capture iteration, independent of the thread that drives it
pub struct CaptureWorker {
    config: CaptureConfig,
    ring: Arc<AudioRingBuffer>,
    clock: Arc<AudioClock>,
    interleaved: Vec<AudioSample>,
    bytes: Vec<u8>,
    blocks: u64,
    silent_blocks: u64,
}

impl CaptureWorker {
    pub fn new(config: CaptureConfig, ring: Arc<AudioRingBuffer>, clock: Arc<AudioClock>) -> Self {
        let interleaved = vec![0; config.block_samples * config.channels as usize];
        let bytes = Vec::with_capacity(config.block_samples * 2);

        Self {
            config,
            ring,
            clock,
            interleaved,
            bytes,
            blocks: 0,
            silent_blocks: 0,
        }
    }

    /// Read one block and push it into the ring
    ///
    /// Returns `false` when the block was zero-filled because the microphone
    /// failed or had nothing to deliver.
    pub fn step(&mut self, mic: &mut dyn Microphone) -> bool {
        let channels = self.config.channels as usize;
        let select = self.config.channel_select as usize;

        let delivered = match mic.read_block(&mut self.interleaved) {
            Ok(n) => n.min(self.interleaved.len()),
            Err(e) => {
                warn!("Microphone read failed, substituting silence: {}", e);
                0
            }
        };

        self.bytes.clear();

        let live = delivered > 0;
        if live {
            let frames = delivered / channels;
            if frames < self.config.block_samples {
                debug!("Short microphone block: {} of {} frames", frames, self.config.block_samples);
            }

            for frame in self.interleaved[..frames * channels].chunks_exact(channels) {
                self.bytes.extend_from_slice(&frame[select].to_le_bytes());
            }
        } else {
            self.bytes.resize(self.config.block_samples * 2, 0);
            self.silent_blocks += 1;
        }

        let written = self.ring.write(&self.bytes);
        self.clock.advance(written / 2);
        self.blocks += 1;

        trace!("Captured block {} ({} bytes)", self.blocks, written);

        live
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn silent_blocks(&self) -> u64 {
        self.silent_blocks
    }
}

/// Capture thread lifecycle
pub struct CaptureTask {
    config: CaptureConfig,
    ring: Arc<AudioRingBuffer>,
    clock: Arc<AudioClock>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureTask {
    pub fn new(config: CaptureConfig, ring: Arc<AudioRingBuffer>, clock: Arc<AudioClock>) -> Self {
        Self {
            config,
            ring,
            clock,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Spawn the capture thread reading from `mic`
    pub fn start(&mut self, mut mic: Box<dyn Microphone>) -> Result<(), CaptureError> {
        if self.is_running() {
            warn!("Capture task already running");
            return Ok(());
        }

        let mut worker = CaptureWorker::new(
            self.config.clone(),
            Arc::clone(&self.ring),
            Arc::clone(&self.clock),
        );
        let running = Arc::clone(&self.running);
        let idle = self.config.block_duration();

        running.store(true, Ordering::Release);

        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                info!("Audio capture started");

                while running.load(Ordering::Acquire) {
                    // Zero-filled blocks still advance the clock, so pace them
                    if !worker.step(mic.as_mut()) {
                        std::thread::sleep(idle);
                    }
                }

                info!(
                    "Audio capture stopped after {} blocks ({} silent)",
                    worker.blocks(),
                    worker.silent_blocks()
                );
            });

        match handle {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Clear the running flag and wait for the thread to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CaptureTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Microphone replaying a 16-bit PCM WAV file
pub struct WavMicrophone {
    reader: hound::WavReader<BufReader<File>>,
    channels: u16,
    sample_rate: u32,
    realtime: bool,
    started: Option<Instant>,
    delivered_frames: u64,
}

impl WavMicrophone {
    /// Open a WAV file, paced in real time
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(CaptureError::InvalidConfig(format!(
                "{} must be 16-bit integer PCM",
                path.as_ref().display()
            )));
        }

        info!(
            "Replaying {} ({} Hz, {} channels)",
            path.as_ref().display(),
            spec.sample_rate,
            spec.channels
        );

        Ok(Self {
            reader,
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            realtime: true,
            started: None,
            delivered_frames: 0,
        })
    }

    /// Deliver blocks as fast as they are requested
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn pace(&mut self) {
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = started
            + Duration::from_micros(self.delivered_frames * 1_000_000 / self.sample_rate.max(1) as u64);

        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
    }
}

impl Microphone for WavMicrophone {
    fn read_block(&mut self, buf: &mut [AudioSample]) -> Result<usize, CaptureError> {
        let mut count = 0;

        for (slot, sample) in buf.iter_mut().zip(self.reader.samples::<i16>()) {
            *slot = sample?;
            count += 1;
        }

        if count == 0 {
            return Ok(0);
        }

        self.delivered_frames += (count / self.channels.max(1) as usize) as u64;
        if self.realtime {
            self.pace();
        }

        Ok(count)
    }
}

#[cfg(feature = "mic")]
pub use self::cpal_input::CpalMicrophone;

#[cfg(feature = "mic")]
mod cpal_input {
    use super::{AudioSample, CaptureConfig, CaptureError, Microphone};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tracing::{info, warn};

    const BLOCK_WAIT: Duration = Duration::from_millis(500);

    /// Default input device through cpal
    ///
    /// The stream handle is not `Send`, so it lives on its own thread and
    /// hands sample blocks over a bounded channel.
    pub struct CpalMicrophone {
        blocks: mpsc::Receiver<Vec<AudioSample>>,
        pending: VecDeque<AudioSample>,
        shutdown: Option<mpsc::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl CpalMicrophone {
        pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
            let (block_tx, blocks) = mpsc::sync_channel::<Vec<AudioSample>>(32);
            let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CaptureError>>();
            let (shutdown, shutdown_rx) = mpsc::channel::<()>();

            let stream_config = cpal::StreamConfig {
                channels: config.channels,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let thread = std::thread::Builder::new()
                .name("cpal-input".to_string())
                .spawn(move || {
                    let stream = match build_stream(&stream_config, block_tx) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    let _ = ready_tx.send(Ok(()));
                    // Keep the stream alive until the microphone is dropped
                    let _ = shutdown_rx.recv();
                    drop(stream);
                })?;

            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(CaptureError::Unavailable(
                        "input thread exited during setup".to_string()
                    ))
                }
            }

            Ok(Self {
                blocks,
                pending: VecDeque::new(),
                shutdown: Some(shutdown),
                thread: Some(thread),
            })
        }
    }

    fn build_stream(
        config: &cpal::StreamConfig,
        block_tx: mpsc::SyncSender<Vec<AudioSample>>,
    ) -> Result<cpal::Stream, CaptureError> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| CaptureError::Unavailable("No input device available".to_string()))?;

        info!(
            "Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let stream = device
            .build_input_stream(
                config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if block_tx.try_send(data.to_vec()).is_err() {
                        warn!("Capture consumer lagging, dropped {} samples", data.len());
                    }
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            )
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        Ok(stream)
    }

    impl Microphone for CpalMicrophone {
        fn read_block(&mut self, buf: &mut [AudioSample]) -> Result<usize, CaptureError> {
            while self.pending.len() < buf.len() {
                match self.blocks.recv_timeout(BLOCK_WAIT) {
                    Ok(block) => self.pending.extend(block),
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        return Err(CaptureError::Read("input device stalled".to_string()))
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        return Err(CaptureError::Unavailable("input stream closed".to_string()))
                    }
                }
            }

            for (slot, sample) in buf.iter_mut().zip(self.pending.drain(..buf.len())) {
                *slot = sample;
            }

            Ok(buf.len())
        }
    }

    impl Drop for CpalMicrophone {
        fn drop(&mut self) {
            self.shutdown.take();
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
