/// Node configuration
///
/// Model shape plus per-component tuning, loaded from an optional JSON file
/// and a few environment overrides. Every section validates itself the same
/// way the component it configures does.

use crate::audio::CaptureConfig;
use crate::features::{FeatureConfig, VadConfig};
use crate::hub::HubConfig;
use crate::orchestrator::{GateConfig, OrchestratorConfig, StreamConfig};
use crate::recognizer::RecognizerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Names the JSON config file
pub const CONFIG_PATH_ENV: &str = "KEYWORD_NODE_CONFIG";
/// Overrides `hub.discovery_port`
pub const DISCOVERY_PORT_ENV: &str = "KEYWORD_NODE_DISCOVERY_PORT";
/// Overrides `hub.device_identifier` (12 hex digits, separators allowed)
pub const DEVICE_ID_ENV: &str = "KEYWORD_NODE_DEVICE_ID";
/// Replays a WAV file instead of opening a microphone
pub const WAV_ENV: &str = "KEYWORD_NODE_WAV";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidOverride { name: String, value: String },

    #[error("Invalid model settings: {0}")]
    InvalidModel(String),

    #[error("Invalid {section} configuration: {message}")]
    Section {
        section: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn section(section: &'static str, err: impl std::fmt::Display) -> Self {
        ConfigError::Section {
            section,
            message: err.to_string(),
        }
    }
}

/// Shape of the classifier input and output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub sample_rate: u32,

    /// Bins per feature slice
    pub feature_slice_size: usize,

    /// Slices in the feature window (N)
    pub feature_slice_count: usize,

    pub feature_slice_stride_ms: u64,

    pub feature_slice_duration_ms: u64,

    /// One label per classifier output
    pub category_labels: Vec<String>,

    pub wake_word_index: usize,

    pub silence_index: Option<usize>,

    pub unknown_index: Option<usize>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            feature_slice_size: 40,
            feature_slice_count: 49,
            feature_slice_stride_ms: 20,
            feature_slice_duration_ms: 30,
            category_labels: ["socorro", "heylola", "apaga", "enciende", "null"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            wake_word_index: 1,
            silence_index: None,
            unknown_index: None,
        }
    }
}

impl ModelSettings {
    /// Samples in one analysis window
    pub fn max_audio_sample_size(&self) -> usize {
        (self.feature_slice_duration_ms * self.sample_rate as u64 / 1000) as usize
    }

    /// Overlap carried from one window into the next
    pub fn history_samples_to_keep(&self) -> usize {
        let overlap_ms = self.feature_slice_duration_ms.saturating_sub(self.feature_slice_stride_ms);
        (overlap_ms * self.sample_rate as u64 / 1000) as usize
    }

    /// Fresh samples drained per window
    pub fn new_samples_to_get(&self) -> usize {
        (self.feature_slice_stride_ms * self.sample_rate as u64 / 1000) as usize
    }

    /// Classifier input length
    pub fn feature_element_count(&self) -> usize {
        self.feature_slice_size * self.feature_slice_count
    }

    pub fn category_count(&self) -> usize {
        self.category_labels.len()
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.category_labels.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.category_labels.iter().position(|l| l == label)
    }

    /// Silence, unknown, or a category labelled `null`
    pub fn is_null_category(&self, index: usize) -> bool {
        Some(index) == self.silence_index
            || Some(index) == self.unknown_index
            || self.label(index) == Some("null")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidModel("sample_rate must be greater than 0".to_string()));
        }

        if self.feature_slice_size == 0 || self.feature_slice_count == 0 {
            return Err(ConfigError::InvalidModel(
                "feature window must have at least one slice and one bin".to_string()
            ));
        }

        if self.feature_slice_stride_ms == 0
            || self.feature_slice_duration_ms < self.feature_slice_stride_ms
        {
            return Err(ConfigError::InvalidModel(format!(
                "slice duration {}ms must cover stride {}ms",
                self.feature_slice_duration_ms, self.feature_slice_stride_ms
            )));
        }

        if self.new_samples_to_get() == 0 {
            return Err(ConfigError::InvalidModel(
                "stride is shorter than one sample".to_string()
            ));
        }

        let count = self.category_count();
        if count < 2 {
            return Err(ConfigError::InvalidModel(
                "at least a wake word and one other category are required".to_string()
            ));
        }

        for (name, index) in [
            ("wake_word_index", Some(self.wake_word_index)),
            ("silence_index", self.silence_index),
            ("unknown_index", self.unknown_index),
        ] {
            if let Some(index) = index {
                if index >= count {
                    return Err(ConfigError::InvalidModel(format!(
                        "{} {} out of range for {} categories",
                        name, index, count
                    )));
                }
            }
        }

        if self.is_null_category(self.wake_word_index) {
            return Err(ConfigError::InvalidModel(
                "wake word cannot be a null category".to_string()
            ));
        }

        Ok(())
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub model: ModelSettings,
    pub capture: CaptureConfig,
    pub features: FeatureConfig,
    pub vad: VadConfig,
    pub recognizer: RecognizerConfig,
    pub gate: GateConfig,
    pub hub: HubConfig,
    pub stream: StreamConfig,
    pub orchestrator: OrchestratorConfig,

    /// WAV file replayed in place of a live microphone
    pub replay_wav: Option<PathBuf>,
}

impl NodeConfig {
    /// Defaults, then the file named by `KEYWORD_NODE_CONFIG`, then env overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => {
                debug!("{} not set, using default configuration", CONFIG_PATH_ENV);
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        info!("Loaded configuration from {}", path.display());
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply overrides from `lookup` (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(DISCOVERY_PORT_ENV) {
            self.hub.discovery_port = value.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                name: DISCOVERY_PORT_ENV.to_string(),
                value: value.clone(),
            })?;
        }

        if let Some(value) = lookup(DEVICE_ID_ENV) {
            self.hub.device_identifier =
                parse_device_id(&value).ok_or_else(|| ConfigError::InvalidOverride {
                    name: DEVICE_ID_ENV.to_string(),
                    value: value.clone(),
                })?;
        }

        if let Some(value) = lookup(WAV_ENV) {
            self.replay_wav = Some(PathBuf::from(value));
        }

        Ok(())
    }

    /// Validate every section and the links between them
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        self.capture.validate().map_err(|e| ConfigError::section("capture", e))?;
        self.features.validate().map_err(|e| ConfigError::section("features", e))?;
        self.vad.validate().map_err(|e| ConfigError::section("vad", e))?;
        self.recognizer.validate().map_err(|e| ConfigError::section("recognizer", e))?;
        self.gate.validate().map_err(|e| ConfigError::section("gate", e))?;
        self.hub.validate().map_err(|e| ConfigError::section("hub", e))?;
        self.stream.validate().map_err(|e| ConfigError::section("stream", e))?;

        if self.capture.sample_rate != self.model.sample_rate {
            return Err(ConfigError::section(
                "capture",
                format!(
                    "sample rate {} Hz does not match model rate {} Hz",
                    self.capture.sample_rate, self.model.sample_rate
                ),
            ));
        }

        let window_bytes = self.model.max_audio_sample_size() * 2;
        if self.capture.ring_capacity_bytes < window_bytes {
            return Err(ConfigError::section(
                "capture",
                format!(
                    "ring of {} bytes cannot hold one {}-byte analysis window",
                    self.capture.ring_capacity_bytes, window_bytes
                ),
            ));
        }

        Ok(())
    }
}

/// Parse a 6-byte device identifier from 12 hex digits
///
/// `:` and `-` separators are ignored.
pub fn parse_device_id(text: &str) -> Option<[u8; 6]> {
    let digits: String = text.chars().filter(|c| *c != ':' && *c != '-').collect();
    if digits.len() != 12 {
        return None;
    }

    let mut id = [0u8; 6];
    for (i, byte) in id.iter_mut().enumerate() {
        *byte = u8::from_str_radix(digits.get(2 * i..2 * i + 2)?, 16).ok()?;
    }

    Some(id)
}
