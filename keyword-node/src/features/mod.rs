/// Feature extraction
///
/// Spectral frontend, voice-activity hysteresis and the sliding feature
/// window that feeds the classifier.

pub mod frontend;
pub mod vad;
pub mod window;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use frontend::{FilterbankFrontend, SpectralFrontend};
pub use vad::{SliceStats, VadConfig, VadError, VadState, VoiceActivityDetector};
pub use window::{FeatureWindowEngine, TickReport, VoiceActivityRing, VoiceSummary};

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Audio window size mismatch: got {got} samples, want {want}")]
    SizeMismatch { got: usize, want: usize },

    #[error("Spectral frontend failed: {0}")]
    Frontend(String),

    #[error("Invalid feature configuration: {0}")]
    InvalidConfig(String),

    #[error("VAD error: {0}")]
    Vad(#[from] VadError),
}

/// Frontend tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Lowest filterbank centre frequency (Hz)
    pub lower_band_hz: f32,

    /// Highest filterbank centre frequency (Hz), clamped below Nyquist
    pub upper_band_hz: f32,

    /// Multiplier applied after log compression
    pub log_scale: f32,

    /// How long a window read waits for the capture task (ms)
    pub read_timeout_ms: u64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lower_band_hz: 125.0,
            upper_band_hz: 7500.0,
            log_scale: 64.0,
            read_timeout_ms: 10,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.lower_band_hz <= 0.0 || self.upper_band_hz <= self.lower_band_hz {
            return Err(FeatureError::InvalidConfig(format!(
                "band limits {}..{} Hz are not increasing",
                self.lower_band_hz, self.upper_band_hz
            )));
        }

        if self.log_scale <= 0.0 {
            return Err(FeatureError::InvalidConfig(
                "log_scale must be greater than 0".to_string()
            ));
        }

        Ok(())
    }
}
