/// Keyword node library
///
/// Edge keyword spotting: lock-free audio capture, a sliding window of
/// quantized spectral features with voice-activity gating, temporal command
/// recognition over classifier scores, and streaming to a hub over a framed
/// TCP protocol.

pub mod audio;
pub mod classifier;
pub mod config;
pub mod features;
pub mod hub;
pub mod node;
pub mod orchestrator;
pub mod recognizer;
pub mod responder;

// Re-export main types
pub use audio::{
    AudioClock, AudioFrame, AudioProvider, AudioRingBuffer, AudioSample, AudioSource, CaptureConfig,
    CaptureError, CaptureTask, CaptureWorker, Microphone, RingBufferError, WavMicrophone,
};
#[cfg(feature = "mic")]
pub use audio::CpalMicrophone;
pub use classifier::{Classifier, ClassifierError, ClassifierSession, NullClassifier};
pub use config::{ConfigError, ModelSettings, NodeConfig};
pub use features::{
    FeatureConfig, FeatureError, FeatureWindowEngine, FilterbankFrontend, SpectralFrontend, VadConfig,
    VadError, VadState, VoiceActivityDetector,
};
pub use hub::{
    AudioEvent, ConnEvent, DiscoveryListener, HubConfig, HubLink, HubLinkHandle, HubMessage, HubSession,
    LinkError, LinkParams, MessageType, ProtocolError,
};
pub use node::{link_params, KeywordNode, NodeError};
pub use orchestrator::{
    GateConfig, Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStats, StreamConfig,
    TickOutcome,
};
pub use recognizer::{CommandRecognizer, Recognition, RecognizerConfig, RecognizerError};
pub use responder::{Responder, SwitchResponder};
