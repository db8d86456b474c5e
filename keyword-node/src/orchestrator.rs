/// Keyword-spotting orchestrator
///
/// Drives the feature window from the audio clock, gates classifier
/// invocation on voice activity and short-term power, feeds the recognizer,
/// and dispatches its verdicts to the responder and the hub link.

use crate::audio::AudioSource;
use crate::classifier::ClassifierSession;
use crate::config::NodeConfig;
use crate::features::{FeatureWindowEngine, VoiceSummary};
use crate::hub::AudioEvent;
use crate::recognizer::{CommandRecognizer, Recognition};
use crate::responder::Responder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn orchestrator thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Pre-invocation gate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum fraction of voiced slices in the window
    pub min_voiced_ratio: f32,

    /// Largest share of the voiced slices allowed in either edge quarter
    pub max_edge_ratio: f32,

    /// Minimum short-term power (feature energy scale, 0..670)
    pub min_power: f32,

    /// Ticks averaged into the short-term power
    pub power_average_ticks: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_voiced_ratio: 1.0 / 3.0,
            max_edge_ratio: 2.0 / 3.0,
            min_power: 50.0,
            power_average_ticks: 3,
        }
    }
}

impl GateConfig {
    /// Gate that lets every window through
    pub fn open() -> Self {
        Self {
            min_voiced_ratio: 0.0,
            max_edge_ratio: 1.0,
            min_power: 0.0,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !(0.0..=1.0).contains(&self.min_voiced_ratio) {
            return Err(OrchestratorError::InvalidConfig(
                "min_voiced_ratio must be between 0.0 and 1.0".to_string()
            ));
        }

        if !(0.0..=1.0).contains(&self.max_edge_ratio) {
            return Err(OrchestratorError::InvalidConfig(
                "max_edge_ratio must be between 0.0 and 1.0".to_string()
            ));
        }

        if self.power_average_ticks == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "power_average_ticks must be greater than 0".to_string()
            ));
        }

        Ok(())
    }

    /// Reason to skip invocation, if any
    pub fn check(&self, voice: &VoiceSummary, power: f32) -> Option<&'static str> {
        let min_voiced = (voice.len as f32 * self.min_voiced_ratio) as usize;
        let max_edge = (voice.voiced as f32 * self.max_edge_ratio) as usize;

        if voice.voiced < min_voiced {
            Some("too few voiced slices")
        } else if voice.end > max_edge {
            Some("voice concentrated at the end")
        } else if voice.beginning > max_edge {
            Some("voice concentrated at the beginning")
        } else if power < self.min_power {
            Some("power below threshold")
        } else {
            None
        }
    }
}

/// Audio streamed to the hub after a detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frame length is `2^frame_size_exponent` samples
    pub frame_size_exponent: u8,

    /// Most recent frames sent per detection
    pub frames: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_size_exponent: 9,
            frames: 32,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !(1..=14).contains(&self.frame_size_exponent) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "frame_size_exponent {} out of range 1..=14",
                self.frame_size_exponent
            )));
        }

        Ok(())
    }

    pub fn frame_samples(&self) -> usize {
        1 << self.frame_size_exponent
    }

    /// Samples of recent audio the feature engine must retain
    pub fn history_samples(&self) -> usize {
        self.frames * self.frame_samples()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Back-off when a tick produced no new slices
    pub idle_sleep_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { idle_sleep_ms: 10 }
    }
}

/// Called with the command label and the short-term power
pub type CommandCallback = Box<dyn FnMut(&str, f32) + Send>;

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The audio source could not supply full windows; nothing changed
    Stalled,

    /// No stride boundary crossed since the last tick
    Idle,

    /// Classifier skipped by the gate
    Gated { reason: &'static str, power: f32 },

    /// Classifier or recognizer rejected this tick's data
    Failed,

    Scored(Recognition),
}

/// Orchestrator counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub ticks: u64,
    pub stalled: u64,
    pub invocations: u64,
    pub gated: u64,
    pub activations: u64,
    pub commands: u64,
}

/// Keyword-spotting control loop
pub struct Orchestrator {
    config: OrchestratorConfig,
    gate: GateConfig,
    stream: StreamConfig,
    source: Box<dyn AudioSource>,
    engine: FeatureWindowEngine,
    classifier: ClassifierSession,
    recognizer: CommandRecognizer,
    responder: Box<dyn Responder>,
    callback: Option<CommandCallback>,
    events: Option<mpsc::UnboundedSender<AudioEvent>>,
    previous_ms: u64,
    power_history: VecDeque<f32>,
    stats: OrchestratorStats,
}

impl Orchestrator {
    pub fn new(
        config: &NodeConfig,
        source: Box<dyn AudioSource>,
        engine: FeatureWindowEngine,
        classifier: ClassifierSession,
        recognizer: CommandRecognizer,
        responder: Box<dyn Responder>,
    ) -> Self {
        Self {
            config: config.orchestrator.clone(),
            gate: config.gate.clone(),
            stream: config.stream.clone(),
            source,
            engine,
            classifier,
            recognizer,
            responder,
            callback: None,
            events: None,
            previous_ms: 0,
            power_history: VecDeque::with_capacity(config.gate.power_average_ticks),
            stats: OrchestratorStats::default(),
        }
    }

    /// Route detection events and streamed frames to the hub link
    pub fn with_events(mut self, events: mpsc::UnboundedSender<AudioEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_callback(mut self, callback: CommandCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// One pass of the control loop
    pub fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;

        let now_ms = self.source.latest_timestamp_ms();
        let report = match self.engine.tick(self.source.as_mut(), self.previous_ms, now_ms) {
            Ok(report) => report,
            Err(e) => {
                debug!("Feature tick at {}ms skipped: {}", now_ms, e);
                self.stats.stalled += 1;
                return TickOutcome::Stalled;
            }
        };
        self.previous_ms = now_ms;

        if report.new_slices == 0 {
            return TickOutcome::Idle;
        }

        let power = self.push_power(report.power);
        let voice = self.engine.voice_ring().summary();

        trace!(
            "vif: {} vib: {} vie: {} power: {:.1}",
            voice.voiced,
            voice.beginning,
            voice.end,
            power
        );

        if let Some(reason) = self.gate.check(&voice, power) {
            trace!("Classifier gated: {}", reason);
            self.stats.gated += 1;
            return TickOutcome::Gated { reason, power };
        }

        let scores = match self.classifier.invoke(self.engine.features()) {
            Ok(scores) => scores,
            Err(e) => {
                error!("Classifier invocation failed: {}", e);
                return TickOutcome::Failed;
            }
        };
        self.stats.invocations += 1;

        let recognition = match self.recognizer.process(scores, now_ms) {
            Ok(recognition) => recognition,
            Err(e) => {
                error!("Recognizer rejected result: {}", e);
                return TickOutcome::Failed;
            }
        };

        if recognition.valid_command {
            if recognition.is_new_command {
                self.stats.commands += 1;
            } else {
                self.stats.activations += 1;
            }
            self.stream_detection(&recognition, now_ms);
        }

        if recognition.is_new_command {
            info!(
                "Command '{}' (score {}, power {:.1})",
                recognition.category, recognition.score, power
            );

            if let Some(callback) = self.callback.as_mut() {
                callback(&recognition.category, power);
            }
            self.responder.respond(&recognition.category);
        }

        TickOutcome::Scored(recognition)
    }

    fn push_power(&mut self, power: f32) -> f32 {
        if self.power_history.len() == self.gate.power_average_ticks {
            self.power_history.pop_front();
        }
        self.power_history.push_back(power);

        self.power_history.iter().sum::<f32>() / self.power_history.len() as f32
    }

    // Detected, then the recent audio frames, then finished
    fn stream_detection(&mut self, recognition: &Recognition, now_ms: u64) {
        let Some(events) = self.events.as_ref() else {
            return;
        };

        let frames = self.engine.recent_frames(self.stream.frame_samples(), now_ms);
        debug!(
            "Streaming '{}' with {} frames",
            recognition.category,
            frames.len()
        );

        let category = recognition.found_index.min(u8::MAX as usize) as u8;
        let sequence = std::iter::once(AudioEvent::ActivityDetected { category })
            .chain(frames.into_iter().map(AudioEvent::Frame))
            .chain(std::iter::once(AudioEvent::Finished));

        let delivered = sequence.into_iter().all(|event| events.send(event).is_ok());
        if !delivered {
            warn!("Hub link gone, dropping detection stream");
            self.events = None;
        }
    }

    pub fn stats(&self) -> &OrchestratorStats {
        &self.stats
    }

    pub fn engine(&self) -> &FeatureWindowEngine {
        &self.engine
    }

    pub fn recognizer(&self) -> &CommandRecognizer {
        &self.recognizer
    }

    /// Run the loop on a dedicated thread
    pub fn spawn(self) -> Result<OrchestratorHandle, OrchestratorError> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(OrchestratorStats::default()));
        let idle = Duration::from_millis(self.config.idle_sleep_ms);

        let thread_running = Arc::clone(&running);
        let thread_stats = Arc::clone(&stats);
        let mut orchestrator = self;

        let handle = std::thread::Builder::new()
            .name("orchestrator".to_string())
            .spawn(move || {
                info!("Orchestrator started");

                while thread_running.load(Ordering::Acquire) {
                    let outcome = orchestrator.tick();
                    *thread_stats.lock() = orchestrator.stats.clone();

                    if matches!(outcome, TickOutcome::Idle | TickOutcome::Stalled) {
                        std::thread::sleep(idle);
                    }
                }

                info!("Orchestrator stopped: {:?}", orchestrator.stats);
            })?;

        Ok(OrchestratorHandle {
            running,
            stats,
            handle: Some(handle),
        })
    }
}

/// Running orchestrator thread
pub struct OrchestratorHandle {
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<OrchestratorStats>>,
    handle: Option<JoinHandle<()>>,
}

impl OrchestratorHandle {
    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Orchestrator thread panicked");
            }
        }
    }
}

impl Drop for OrchestratorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
