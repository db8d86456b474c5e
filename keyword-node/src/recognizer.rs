/// Command recognizer
///
/// Smooths classifier scores over a sliding time window and runs the
/// activation/command hysteresis: a wake word arms the recognizer, the next
/// confident non-null category is reported as a new command.

use crate::config::ModelSettings;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, error, info, trace};

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("Score vector has {got} entries, expected {want}")]
    ShapeMismatch { got: usize, want: usize },

    #[error("Results must be fed in increasing time order: got {timestamp_ms}ms after {newest_ms}ms")]
    OutOfOrder { timestamp_ms: u64, newest_ms: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Recognizer tuning
///
/// Scores are compared on the offset scale (raw int8 + 128, so 0..=255).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub average_window_duration_ms: u64,
    pub detection_threshold: u8,
    pub weak_detection_threshold: u8,

    /// Activation is dropped when no command follows within this time
    pub timeout_ms: u64,

    /// Consecutive identical tops tolerated without a transition
    pub max_consecutive_tops: u32,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            average_window_duration_ms: 1000,
            detection_threshold: 200,
            weak_detection_threshold: 150,
            timeout_ms: 2000,
            max_consecutive_tops: 3,
        }
    }
}

impl RecognizerConfig {
    pub fn validate(&self) -> Result<(), RecognizerError> {
        if self.weak_detection_threshold > self.detection_threshold {
            return Err(RecognizerError::InvalidConfig(format!(
                "weak threshold {} above detection threshold {}",
                self.weak_detection_threshold, self.detection_threshold
            )));
        }

        if self.max_consecutive_tops == 0 {
            return Err(RecognizerError::InvalidConfig(
                "max_consecutive_tops must be greater than 0".to_string()
            ));
        }

        Ok(())
    }
}

/// Outcome of one `process` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recognition {
    /// Top category index of the averaged scores
    pub found_index: usize,

    pub category: String,

    /// Averaged score of the top category (offset scale)
    pub score: u8,

    /// A command followed an activation
    pub is_new_command: bool,

    /// Activation or command edge; gates audio streaming
    pub valid_command: bool,
}

struct ResultEntry {
    timestamp_ms: u64,
    scores: Vec<i8>,
}

/// Time-ordered queue of recent score vectors
struct ResultHistory {
    entries: VecDeque<ResultEntry>,
}

impl ResultHistory {
    fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    fn newest_ms(&self) -> Option<u64> {
        self.entries.back().map(|e| e.timestamp_ms)
    }

    fn push(&mut self, timestamp_ms: u64, scores: &[i8], window_ms: u64) {
        self.entries.push_back(ResultEntry {
            timestamp_ms,
            scores: scores.to_vec(),
        });

        let limit = timestamp_ms.saturating_sub(window_ms);
        while self.entries.front().map_or(false, |e| e.timestamp_ms < limit) {
            self.entries.pop_front();
        }
    }

    /// Per-category mean on the offset scale
    fn averages(&self, categories: usize) -> Vec<u32> {
        let mut sums = vec![0u32; categories];
        for entry in &self.entries {
            for (sum, &score) in sums.iter_mut().zip(&entry.scores) {
                *sum += (score as i32 + 128) as u32;
            }
        }

        let count = self.entries.len().max(1) as u32;
        sums.iter().map(|s| s / count).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Command recognizer state machine
pub struct CommandRecognizer {
    config: RecognizerConfig,
    labels: Vec<String>,
    null_categories: Vec<bool>,
    wake_index: usize,
    history: ResultHistory,
    previous_top: Option<usize>,
    consecutive_tops: u32,
    accumulated_score: u32,
    activated: bool,
    weak_activation: bool,
    activation_time_ms: u64,
}

impl CommandRecognizer {
    pub fn new(config: RecognizerConfig, settings: &ModelSettings) -> Result<Self, RecognizerError> {
        config.validate()?;

        debug!("Initializing recognizer with config: {:?}", config);

        Ok(Self {
            config,
            labels: settings.category_labels.clone(),
            null_categories: (0..settings.category_count())
                .map(|i| settings.is_null_category(i))
                .collect(),
            wake_index: settings.wake_word_index,
            history: ResultHistory::new(),
            previous_top: None,
            consecutive_tops: 0,
            accumulated_score: 0,
            activated: false,
            weak_activation: false,
            activation_time_ms: 0,
        })
    }

    /// Feed the latest classifier output
    ///
    /// Malformed or out-of-order input is rejected before any state changes.
    pub fn process(&mut self, scores: &[i8], timestamp_ms: u64) -> Result<Recognition, RecognizerError> {
        let categories = self.labels.len();
        if scores.len() != categories {
            error!("Score vector has {} entries, expected {}", scores.len(), categories);
            return Err(RecognizerError::ShapeMismatch {
                got: scores.len(),
                want: categories,
            });
        }

        if let Some(newest_ms) = self.history.newest_ms() {
            if timestamp_ms < newest_ms {
                error!("Out-of-order result at {}ms (newest {}ms)", timestamp_ms, newest_ms);
                return Err(RecognizerError::OutOfOrder { timestamp_ms, newest_ms });
            }
        }

        self.history.push(timestamp_ms, scores, self.config.average_window_duration_ms);
        let averages = self.history.averages(categories);

        let mut top = 0;
        for (i, &avg) in averages.iter().enumerate().skip(1) {
            if avg > averages[top] {
                top = i;
            }
        }
        let score = averages[top].min(u8::MAX as u32) as u8;

        trace!(
            "Averages at {}ms over {} results: {:?}, top {} ({})",
            timestamp_ms,
            self.history.len(),
            averages,
            self.labels[top],
            score
        );

        let mut recognition = Recognition {
            found_index: top,
            category: self.labels[top].clone(),
            score,
            is_new_command: false,
            valid_command: false,
        };

        if self.activated
            && timestamp_ms.saturating_sub(self.activation_time_ms) > self.config.timeout_ms
        {
            info!("Activation timed out after {}ms", self.config.timeout_ms);
            self.reset();
        }

        if self.previous_top == Some(top) {
            self.consecutive_tops += 1;
            self.accumulated_score += score as u32;
        } else {
            self.previous_top = Some(top);
            self.consecutive_tops = 1;
            self.accumulated_score = score as u32;
        }

        if self.null_categories[top] {
            return Ok(recognition);
        }

        let held_wake = top == self.wake_index && self.activated;
        if self.consecutive_tops > self.config.max_consecutive_tops && !held_wake {
            debug!(
                "'{}' stayed on top for {} results without a transition, resetting",
                self.labels[top], self.consecutive_tops
            );
            self.reset();
            return Ok(recognition);
        }

        let threshold = self.config.detection_threshold;
        let weak_threshold = self.config.weak_detection_threshold;

        if top == self.wake_index {
            if self.activated {
                return Ok(recognition);
            }

            let mean = self.accumulated_score / self.consecutive_tops;
            if score >= threshold {
                self.activate(timestamp_ms, false);
                recognition.valid_command = true;
            } else if self.consecutive_tops >= 2 && mean >= weak_threshold as u32 {
                self.activate(timestamp_ms, true);
                recognition.valid_command = true;
            }
        } else if self.activated {
            let required = if self.weak_activation { threshold } else { weak_threshold };

            if score >= required {
                info!("Command '{}' recognized (score {})", self.labels[top], score);
                self.activated = false;
                self.weak_activation = false;
                recognition.is_new_command = true;
                recognition.valid_command = true;
            } else {
                debug!(
                    "Discarding '{}' (score {} below {})",
                    self.labels[top], score, required
                );
            }
        }

        Ok(recognition)
    }

    fn activate(&mut self, timestamp_ms: u64, weak: bool) {
        self.activated = true;
        self.weak_activation = weak;
        self.activation_time_ms = timestamp_ms;

        if weak {
            info!("Weak activation at {}ms", timestamp_ms);
        } else {
            info!("Activation at {}ms", timestamp_ms);
        }
    }

    /// Drop activation and consecutive-top tracking
    ///
    /// The averaging history is kept.
    pub fn reset(&mut self) {
        self.activated = false;
        self.weak_activation = false;
        self.previous_top = None;
        self.consecutive_tops = 0;
        self.accumulated_score = 0;
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn is_weak_activation(&self) -> bool {
        self.weak_activation
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }
}
