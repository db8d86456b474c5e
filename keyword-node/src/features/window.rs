/// Sliding feature window
///
/// Keeps the last `N` quantized slices in classifier order. Each tick shifts
/// the retained slices left and computes only the new ones. A tick either
/// commits completely or, on a stalled capture pipeline, leaves every piece
/// of window state as it was.

use super::frontend::SpectralFrontend;
use super::vad::{SliceStats, VadConfig, VadState, VoiceActivityDetector};
use super::FeatureError;
use crate::audio::{AudioFrame, AudioSample, AudioSource};
use crate::config::ModelSettings;
use std::collections::VecDeque;
use tracing::{debug, error, trace};

/// Voiced-slice counts over the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoiceSummary {
    /// Voiced slices in the whole window
    pub voiced: usize,

    /// Voiced slices among the oldest quarter
    pub beginning: usize,

    /// Voiced slices among the newest quarter
    pub end: usize,

    /// Window depth
    pub len: usize,
}

/// Circular per-slice voice flags
#[derive(Debug, Clone)]
pub struct VoiceActivityRing {
    entries: Vec<bool>,
    write: usize,
}

impl VoiceActivityRing {
    pub fn new(len: usize) -> Self {
        Self {
            entries: vec![false; len],
            write: 0,
        }
    }

    pub fn push(&mut self, voiced: bool) {
        if self.entries.is_empty() {
            return;
        }

        self.entries[self.write] = voiced;
        self.write = (self.write + 1) % self.entries.len();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flags from the oldest slice to the newest
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        let len = self.entries.len();
        (0..len).map(move |i| self.entries[(i + self.write) % len])
    }

    pub fn summary(&self) -> VoiceSummary {
        let len = self.entries.len();
        let mut summary = VoiceSummary { len, ..Default::default() };

        for (position, voiced) in self.iter().enumerate() {
            if !voiced {
                continue;
            }

            summary.voiced += 1;
            if position < len / 4 {
                summary.beginning += 1;
            }
            if position > 3 * len / 4 {
                summary.end += 1;
            }
        }

        summary
    }
}

/// Outcome of one successful tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    /// Slices computed this tick (0 when the clock has not crossed a stride)
    pub new_slices: usize,

    /// Mean feature energy of the new slices
    pub power: f32,

    /// VAD verdict after the last new slice
    pub voice_active: bool,
}

/// Sliding window of quantized feature slices
pub struct FeatureWindowEngine {
    bins: usize,
    slice_count: usize,
    stride_ms: u64,
    duration_ms: u64,
    sample_rate: u32,
    window_samples: usize,
    fresh_samples: usize,
    frontend: Box<dyn SpectralFrontend>,
    vad: VoiceActivityDetector,
    features: Vec<i8>,
    staging: Vec<i8>,
    staged_stats: Vec<SliceStats>,
    staged_audio: Vec<AudioSample>,
    voice: VoiceActivityRing,
    recent_audio: VecDeque<AudioSample>,
    recent_capacity: usize,
    first_tick: bool,
    slices_computed: u64,
}

impl FeatureWindowEngine {
    /// `recent_capacity` is the number of fresh samples kept for streaming
    pub fn new(
        settings: &ModelSettings,
        vad_config: VadConfig,
        frontend: Box<dyn SpectralFrontend>,
        recent_capacity: usize,
    ) -> Result<Self, FeatureError> {
        vad_config.validate()?;

        if frontend.bins() != settings.feature_slice_size {
            return Err(FeatureError::InvalidConfig(format!(
                "frontend produces {} bins, model expects {}",
                frontend.bins(),
                settings.feature_slice_size
            )));
        }

        if settings.feature_slice_count == 0 || settings.feature_slice_stride_ms == 0 {
            return Err(FeatureError::InvalidConfig(
                "slice count and stride must be greater than 0".to_string()
            ));
        }

        let bins = settings.feature_slice_size;
        let slice_count = settings.feature_slice_count;

        debug!(
            "Feature window: {} slices x {} bins, stride {}ms, duration {}ms",
            slice_count, bins, settings.feature_slice_stride_ms, settings.feature_slice_duration_ms
        );

        Ok(Self {
            bins,
            slice_count,
            stride_ms: settings.feature_slice_stride_ms,
            duration_ms: settings.feature_slice_duration_ms,
            sample_rate: settings.sample_rate,
            window_samples: settings.max_audio_sample_size(),
            fresh_samples: settings.new_samples_to_get(),
            frontend,
            vad: VoiceActivityDetector::with_config(vad_config),
            features: vec![0; bins * slice_count],
            staging: vec![0; bins * slice_count],
            staged_stats: Vec::with_capacity(slice_count),
            staged_audio: Vec::with_capacity(slice_count * settings.new_samples_to_get()),
            voice: VoiceActivityRing::new(slice_count),
            recent_audio: VecDeque::with_capacity(recent_capacity),
            recent_capacity,
            first_tick: true,
            slices_computed: 0,
        })
    }

    /// Bring the window up to `now_ms`, given the clock at the last successful tick
    pub fn tick(
        &mut self,
        source: &mut dyn AudioSource,
        last_ms: u64,
        now_ms: u64,
    ) -> Result<TickReport, FeatureError> {
        let current_step = now_ms / self.stride_ms;
        let last_step = last_ms / self.stride_ms;

        let slices_needed = if self.first_tick {
            self.slice_count
        } else {
            (current_step.saturating_sub(last_step) as usize).min(self.slice_count)
        };

        if slices_needed == 0 {
            return Ok(TickReport {
                new_slices: 0,
                power: 0.0,
                voice_active: self.vad.is_speech_active(),
            });
        }

        let energy = self.stage(source, current_step, slices_needed)?;
        self.commit(slices_needed);

        trace!("Tick at {}ms: {} new slices", now_ms, slices_needed);

        Ok(TickReport {
            new_slices: slices_needed,
            power: energy / slices_needed as f32,
            voice_active: self.vad.is_speech_active(),
        })
    }

    // Compute new slices into staging buffers only
    fn stage(
        &mut self,
        source: &mut dyn AudioSource,
        current_step: u64,
        slices_needed: usize,
    ) -> Result<f32, FeatureError> {
        self.staged_stats.clear();
        self.staged_audio.clear();

        let mut energy = 0.0;
        let first_step = (current_step + 1).saturating_sub(slices_needed as u64);

        for i in 0..slices_needed {
            let start_ms = (first_step + i as u64) * self.stride_ms;
            let window = source.get_audio_samples(start_ms, self.duration_ms);

            if window.len() < self.window_samples {
                error!(
                    "Audio window at {}ms too small: {} samples, want {}",
                    start_ms,
                    window.len(),
                    self.window_samples
                );
                return Err(FeatureError::SizeMismatch {
                    got: window.len(),
                    want: self.window_samples,
                });
            }

            let window = &window[..self.window_samples];
            let out = &mut self.staging[i * self.bins..(i + 1) * self.bins];

            energy += self.frontend.process(window, out)?;
            self.staged_stats.push(SliceStats::from_samples(window, self.sample_rate));
            self.staged_audio
                .extend_from_slice(&window[self.window_samples - self.fresh_samples..]);
        }

        Ok(energy)
    }

    fn commit(&mut self, slices_needed: usize) {
        let keep = self.slice_count - slices_needed;
        let new_len = slices_needed * self.bins;

        if keep > 0 {
            self.features.copy_within(new_len.., 0);
        }
        self.features[keep * self.bins..].copy_from_slice(&self.staging[..new_len]);

        for stats in &self.staged_stats {
            let voiced = self.vad.update(*stats);
            self.voice.push(voiced);
        }

        self.recent_audio.extend(self.staged_audio.iter().copied());
        while self.recent_audio.len() > self.recent_capacity {
            self.recent_audio.pop_front();
        }

        self.slices_computed += slices_needed as u64;
        self.first_tick = false;
    }

    /// Window contents, oldest slice first
    pub fn features(&self) -> &[i8] {
        &self.features
    }

    /// One slice of the window
    pub fn slice(&self, index: usize) -> Option<&[i8]> {
        if index >= self.slice_count {
            return None;
        }

        Some(&self.features[index * self.bins..(index + 1) * self.bins])
    }

    pub fn voice_ring(&self) -> &VoiceActivityRing {
        &self.voice
    }

    pub fn vad_state(&self) -> VadState {
        self.vad.state()
    }

    pub fn noise_floor(&self) -> f32 {
        self.vad.noise_floor()
    }

    pub fn is_first_tick(&self) -> bool {
        self.first_tick
    }

    pub fn slices_computed(&self) -> u64 {
        self.slices_computed
    }

    pub fn slice_count(&self) -> usize {
        self.slice_count
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    /// Most recent captured audio cut into frames, oldest first
    ///
    /// Only whole frames are returned; the last frame ends at `end_ms`.
    pub fn recent_frames(&self, frame_samples: usize, end_ms: u64) -> Vec<AudioFrame> {
        if frame_samples == 0 {
            return Vec::new();
        }

        let frames = self.recent_audio.len() / frame_samples;
        let skip = self.recent_audio.len() - frames * frame_samples;
        let frame_ms = frame_samples as u64 * 1000 / self.sample_rate.max(1) as u64;

        let samples: Vec<AudioSample> = self.recent_audio.iter().skip(skip).copied().collect();

        samples
            .chunks_exact(frame_samples)
            .enumerate()
            .map(|(i, chunk)| {
                let timestamp_ms = end_ms.saturating_sub((frames - i) as u64 * frame_ms);
                AudioFrame::new(timestamp_ms, chunk.to_vec())
            })
            .collect()
    }

    /// Fresh samples currently held for streaming
    pub fn recent_audio_len(&self) -> usize {
        self.recent_audio.len()
    }
}
