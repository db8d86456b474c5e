/// Slice voicing detector
///
/// Five-state hysteresis machine over per-slice power and zero-crossing
/// statistics, with an adaptive noise floor. Used to gate classifier
/// invocation and to mark which slices of the feature window carry voice.

use crate::audio::AudioSample;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Error, Debug)]
pub enum VadError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Hysteresis and noise-floor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Slices averaged into the initial noise floor
    pub init_ticks: usize,

    /// Consecutive evident slices needed to confirm speech onset
    pub speech_onset_ticks: usize,

    /// Consecutive quiet slices needed to confirm speech offset
    pub speech_release_ticks: usize,

    /// Power must exceed the noise floor by this factor to count as evidence
    pub power_ratio: f32,

    /// Lower bound on zero crossings per 10ms for voiced audio
    pub min_zcr: f32,

    /// Upper bound on zero crossings per 10ms for voiced audio
    pub max_zcr: f32,

    /// Noise floor smoothing factor `p` in `NSTP = p*NSTP + (1-p)*STP`
    pub smoothing: f32,

    /// Smoothing factor used when power deviates strongly from the floor
    pub fast_smoothing: f32,

    /// Deviation (either direction) that switches to `fast_smoothing`
    pub fast_adapt_ratio: f32,

    /// Floor below which the noise estimate is never taken
    pub min_noise_floor: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            init_ticks: 4,
            speech_onset_ticks: 2,
            speech_release_ticks: 2,
            power_ratio: 1.7,
            min_zcr: 30.0,
            max_zcr: 70.0,
            smoothing: 0.5,
            fast_smoothing: 0.2,
            fast_adapt_ratio: 4.0,
            min_noise_floor: 1.0,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<(), VadError> {
        if self.init_ticks == 0 {
            return Err(VadError::InvalidConfig(
                "init_ticks must be greater than 0".to_string()
            ));
        }

        if self.power_ratio < 1.0 {
            return Err(VadError::InvalidConfig(
                "power_ratio must be at least 1.0".to_string()
            ));
        }

        if self.min_zcr < 0.0 || self.max_zcr <= self.min_zcr {
            return Err(VadError::InvalidConfig(format!(
                "zero-crossing band {}..{} is empty",
                self.min_zcr, self.max_zcr
            )));
        }

        for (name, p) in [("smoothing", self.smoothing), ("fast_smoothing", self.fast_smoothing)] {
            if !(0.0..1.0).contains(&p) {
                return Err(VadError::InvalidConfig(format!(
                    "{} must be in [0.0, 1.0)",
                    name
                )));
            }
        }

        if self.fast_adapt_ratio <= 1.0 {
            return Err(VadError::InvalidConfig(
                "fast_adapt_ratio must be greater than 1.0".to_string()
            ));
        }

        Ok(())
    }
}

/// Hysteresis states; speech moves Init, Noise, ToSpeech, Speech, ToNoise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VadState {
    /// Collecting the initial noise floor
    Init,

    /// Background only
    Noise,

    /// Evidence seen, waiting for confirmation
    ToSpeech,

    /// Speech confirmed
    Speech,

    /// Evidence lost, waiting for confirmation
    ToNoise,
}

/// Short-term statistics of one analysis window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SliceStats {
    /// Mean squared sample value
    pub power: f32,

    /// Zero crossings per 10ms
    pub zcr: f32,
}

impl SliceStats {
    pub fn from_samples(samples: &[AudioSample], sample_rate: u32) -> Self {
        if samples.len() < 2 {
            return Self::default();
        }

        let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let power = (sum_squares / samples.len() as f64) as f32;

        let crossings = samples
            .windows(2)
            .filter(|pair| (pair[0] >= 0 && pair[1] < 0) || (pair[0] < 0 && pair[1] >= 0))
            .count();

        // Normalize to crossings per 10ms
        let zcr = crossings as f32 * (sample_rate as f32 / 100.0) / samples.len() as f32;

        Self { power, zcr }
    }
}

/// Per-slice voicing decision with dwell times on both edges
pub struct VoiceActivityDetector {
    config: VadConfig,
    state: VadState,
    noise_floor: f32,
    n_trans: usize,
    init_seen: usize,
}

impl VoiceActivityDetector {
    pub fn with_config(config: VadConfig) -> Self {
        debug!("VAD tuning: {:?}", config);

        Self {
            config,
            state: VadState::Init,
            noise_floor: 0.0,
            n_trans: 0,
            init_seen: 0,
        }
    }

    /// Feed one slice and return whether voice is currently active
    pub fn update(&mut self, stats: SliceStats) -> bool {
        let floor = self.noise_floor.max(self.config.min_noise_floor);
        let evident = stats.power > self.config.power_ratio * floor
            && self.config.min_zcr < stats.zcr
            && stats.zcr < self.config.max_zcr;

        trace!(
            "Slice analysis: power={:.1}, zcr={:.1}, floor={:.1}, evident={}, state={:?}",
            stats.power, stats.zcr, self.noise_floor, evident, self.state
        );

        match self.state {
            VadState::Init => {
                self.noise_floor += stats.power;
                self.init_seen += 1;

                if self.init_seen >= self.config.init_ticks {
                    self.noise_floor /= self.init_seen as f32;
                    self.state = VadState::Noise;
                    debug!("State: Init -> Noise (floor {:.1})", self.noise_floor);
                }
            }

            VadState::Noise => {
                if evident {
                    self.enter_to_speech();
                } else {
                    self.adapt_floor(stats.power);
                }
            }

            VadState::ToSpeech => {
                if !evident {
                    self.state = VadState::Noise;
                    debug!("State: ToSpeech -> Noise (false alarm)");
                } else if self.n_trans > 1 {
                    self.n_trans -= 1;
                } else {
                    self.state = VadState::Speech;
                    info!("Speech onset confirmed");
                }
            }

            VadState::Speech => {
                if !evident {
                    self.enter_to_noise();
                }
            }

            VadState::ToNoise => {
                if evident {
                    self.state = VadState::Speech;
                    debug!("State: ToNoise -> Speech (continued)");
                } else if self.n_trans > 1 {
                    self.n_trans -= 1;
                } else {
                    self.state = VadState::Noise;
                    debug!("State: ToNoise -> Noise (speech ended)");
                }
            }
        }

        self.is_speech_active()
    }

    // The entering slice counts toward the dwell, so a dwell of one confirms at once.
    fn enter_to_speech(&mut self) {
        if self.config.speech_onset_ticks <= 1 {
            self.state = VadState::Speech;
            info!("Speech onset confirmed");
            return;
        }

        self.state = VadState::ToSpeech;
        self.n_trans = self.config.speech_onset_ticks - 1;
        debug!("State: Noise -> ToSpeech");
    }

    fn enter_to_noise(&mut self) {
        if self.config.speech_release_ticks <= 1 {
            self.state = VadState::Noise;
            debug!("State: Speech -> Noise (speech ended)");
            return;
        }

        self.state = VadState::ToNoise;
        self.n_trans = self.config.speech_release_ticks - 1;
        debug!("State: Speech -> ToNoise");
    }

    fn adapt_floor(&mut self, power: f32) {
        let floor = self.noise_floor.max(self.config.min_noise_floor);
        let ratio = self.config.fast_adapt_ratio;

        let p = if power > ratio * floor || power * ratio < floor {
            self.config.fast_smoothing
        } else {
            self.config.smoothing
        };

        self.noise_floor = p * self.noise_floor + (1.0 - p) * power;
    }

    /// Speech confirmed and not yet released
    pub fn is_speech_active(&self) -> bool {
        matches!(self.state, VadState::Speech | VadState::ToNoise)
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Current noise floor estimate (NSTP)
    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }
}
