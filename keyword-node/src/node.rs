/// Keyword node assembly
///
/// Builds the audio, feature, classifier and recognizer stages from a
/// `NodeConfig` and owns the capture and orchestrator threads.

use crate::audio::{
    AudioClock, AudioProvider, AudioRingBuffer, CaptureError, CaptureTask, Microphone, RingBufferError,
};
use crate::classifier::{Classifier, ClassifierError, ClassifierSession};
use crate::config::{ConfigError, NodeConfig};
use crate::features::{FeatureError, FeatureWindowEngine, FilterbankFrontend};
use crate::hub::{AudioEvent, LinkParams};
use crate::orchestrator::{
    CommandCallback, Orchestrator, OrchestratorError, OrchestratorHandle, OrchestratorStats,
};
use crate::recognizer::{CommandRecognizer, RecognizerError};
use crate::responder::Responder;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ring buffer error: {0}")]
    RingBuffer(#[from] RingBufferError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Feature error: {0}")]
    Feature(#[from] FeatureError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Node already started")]
    AlreadyStarted,
}

/// Link parameters derived from the node configuration
pub fn link_params(config: &NodeConfig) -> LinkParams {
    LinkParams {
        sample_rate: config.model.sample_rate,
        frame_samples: config.stream.frame_samples(),
        streaming_category: config.model.wake_word_index.min(u8::MAX as usize) as u8,
        login: config.hub.login(config.stream.frame_size_exponent),
    }
}

/// Fully wired keyword-spotting node
pub struct KeywordNode {
    ring: Arc<AudioRingBuffer>,
    clock: Arc<AudioClock>,
    capture: CaptureTask,
    orchestrator: Option<Orchestrator>,
    handle: Option<OrchestratorHandle>,
}

impl KeywordNode {
    /// Build every stage; any failure here is fatal
    pub fn new(
        config: NodeConfig,
        classifier: Box<dyn Classifier>,
        responder: Box<dyn Responder>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let settings = &config.model;
        let ring = Arc::new(AudioRingBuffer::with_capacity(config.capture.ring_capacity_bytes)?);
        let clock = Arc::new(AudioClock::new(settings.sample_rate));

        let source = AudioProvider::new(
            Arc::clone(&ring),
            Arc::clone(&clock),
            settings.history_samples_to_keep(),
            settings.new_samples_to_get(),
            Duration::from_millis(config.features.read_timeout_ms),
        );

        let frontend = FilterbankFrontend::new(settings.sample_rate, settings.feature_slice_size, &config.features)?;
        let engine = FeatureWindowEngine::new(
            settings,
            config.vad.clone(),
            Box::new(frontend),
            config.stream.history_samples(),
        )?;

        let classifier = ClassifierSession::new(classifier, settings)?;
        let recognizer = CommandRecognizer::new(config.recognizer.clone(), settings)?;

        let orchestrator = Orchestrator::new(
            &config,
            Box::new(source),
            engine,
            classifier,
            recognizer,
            responder,
        );

        let capture = CaptureTask::new(config.capture.clone(), Arc::clone(&ring), Arc::clone(&clock));

        info!(
            "Keyword node ready: {} categories, wake word '{}'",
            settings.category_count(),
            settings.label(settings.wake_word_index).unwrap_or("?")
        );

        Ok(Self {
            ring,
            clock,
            capture,
            orchestrator: Some(orchestrator),
            handle: None,
        })
    }

    /// Route detection streams to the hub link
    pub fn with_events(mut self, events: mpsc::UnboundedSender<AudioEvent>) -> Self {
        self.orchestrator = self.orchestrator.take().map(|o| o.with_events(events));
        self
    }

    pub fn with_callback(mut self, callback: CommandCallback) -> Self {
        self.orchestrator = self.orchestrator.take().map(|o| o.with_callback(callback));
        self
    }

    /// Start capturing from `mic` and run the orchestrator loop
    pub fn start(&mut self, mic: Box<dyn Microphone>) -> Result<(), NodeError> {
        let orchestrator = self.orchestrator.take().ok_or(NodeError::AlreadyStarted)?;

        self.capture.start(mic)?;
        match orchestrator.spawn() {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                self.capture.stop();
                return Err(e.into());
            }
        }

        info!("Keyword node started");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
            info!("Keyword node stopped: {:?}", handle.stats());
        } else if self.orchestrator.is_some() {
            warn!("Keyword node not running");
        }

        self.capture.stop();

        if !self.ring.is_empty() {
            debug!(
                "{} of {} ring buffer bytes left unread",
                self.ring.len(),
                self.ring.capacity()
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| h.is_running())
    }

    pub fn stats(&self) -> Option<OrchestratorStats> {
        self.handle.as_ref().map(|h| h.stats())
    }

    /// The orchestrator before `start`, for driving ticks by hand
    pub fn orchestrator_mut(&mut self) -> Option<&mut Orchestrator> {
        self.orchestrator.as_mut()
    }

    pub fn ring(&self) -> &Arc<AudioRingBuffer> {
        &self.ring
    }

    pub fn clock(&self) -> &Arc<AudioClock> {
        &self.clock
    }
}

impl Drop for KeywordNode {
    fn drop(&mut self) {
        self.stop();
    }
}
