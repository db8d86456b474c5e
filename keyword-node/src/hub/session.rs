/// Hub session state and event handlers
///
/// Both handlers are pure: they update the `HubSession` and return the side
/// effects for the link runtime to carry out, in order.

use super::protocol::{parse_audio_request, HubMessage, Login, MessageType, ProtocolError, SyncInfo};
use crate::audio::AudioFrame;
use bytes::Bytes;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

/// Link flags shared by the orchestrator-facing and network-facing handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSession {
    /// A TCP connection is open (or being opened)
    pub connected: bool,

    /// The hub acknowledged us; detection events may be sent
    pub hub_available: bool,

    /// The hub asked for audio
    pub permission_to_send: bool,

    /// Frames still allowed, -1 for unlimited
    pub frames_remaining: i32,

    /// Outbound sequence number for detection and audio messages
    pub sequence: u8,

    pub endpoint: Option<SocketAddr>,
}

impl Default for HubSession {
    fn default() -> Self {
        Self {
            connected: false,
            hub_available: false,
            permission_to_send: false,
            frames_remaining: -1,
            sequence: 0,
            endpoint: None,
        }
    }
}

impl HubSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audio frames would currently go out
    pub fn can_stream(&self) -> bool {
        self.connected && self.permission_to_send && self.frames_remaining != 0
    }

    fn next_sequence(&mut self) -> u8 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    fn drop_connection(&mut self) {
        self.connected = false;
        self.hub_available = false;
        self.permission_to_send = false;
        self.frames_remaining = -1;
        self.endpoint = None;
    }
}

/// Events produced by the audio pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// Voice activity with a recognized category
    ActivityDetected { category: u8 },
    Frame(AudioFrame),
    Finished,
}

/// Events produced by the hub connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnEvent {
    Sync(SyncInfo),
    AudioRequest { seconds: i32 },
    AudioStop,
    MasterAvailable,
    MasterUnavailable,
    LoginAck,
    StartStreaming,
    StopStreaming,
    OutputOn,
    OutputOff,
    AssistantState(Bytes),
    /// The socket was torn down
    Dropped,
}

impl ConnEvent {
    /// Map an inbound message to its connection event
    ///
    /// Node-to-hub message types have no inbound meaning and yield `None`.
    pub fn from_message(message: &HubMessage) -> Result<Option<Self>, ProtocolError> {
        let event = match message.kind {
            MessageType::Synchronization => ConnEvent::Sync(SyncInfo::parse(message)?),
            MessageType::AudioRequest => ConnEvent::AudioRequest {
                seconds: parse_audio_request(message)?,
            },
            MessageType::AudioStop => ConnEvent::AudioStop,
            MessageType::MasterAvailable => ConnEvent::MasterAvailable,
            MessageType::MasterUnavailable => ConnEvent::MasterUnavailable,
            MessageType::LoginAck => ConnEvent::LoginAck,
            MessageType::StartOfStreamingMode => ConnEvent::StartStreaming,
            MessageType::StopOfStreamingMode => ConnEvent::StopStreaming,
            MessageType::OutputOn => ConnEvent::OutputOn,
            MessageType::OutputOff => ConnEvent::OutputOff,
            MessageType::AssistantState => ConnEvent::AssistantState(message.payload.clone()),
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

/// Side effects requested by a handler
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open a connection to the hub; the login goes out right after
    Connect(SocketAddr),
    Send(HubMessage),
    /// Feed an event back into the audio handler
    Post(AudioEvent),
    Disconnect,
}

/// Fixed values the handlers need
#[derive(Debug, Clone, Copy)]
pub struct LinkParams {
    pub sample_rate: u32,
    pub frame_samples: usize,
    /// Category announced when the hub starts streaming mode
    pub streaming_category: u8,
    pub login: Login,
}

impl LinkParams {
    /// Frames covering `seconds` of audio (-1 for a negative request)
    pub fn frames_for(&self, seconds: i32) -> i32 {
        if seconds < 0 {
            return -1;
        }

        let frames = seconds as i64 * self.sample_rate as i64 / self.frame_samples.max(1) as i64;
        frames.min(i32::MAX as i64) as i32
    }
}

/// Audio pipeline dispatch
pub fn handle_audio_event(session: &mut HubSession, event: AudioEvent) -> Vec<Effect> {
    match event {
        AudioEvent::ActivityDetected { category } => {
            if !session.connected || !session.hub_available {
                debug!("Hub not available, dropping detection of category {}", category);
                return Vec::new();
            }

            let seq = session.next_sequence();
            info!("Reporting activity (category {}, seq {})", category, seq);
            vec![Effect::Send(HubMessage::audio_detected(seq, category))]
        }

        AudioEvent::Frame(frame) => {
            if !session.can_stream() {
                trace!("Streaming not permitted, dropping frame at {}ms", frame.timestamp_ms);
                return Vec::new();
            }

            let seq = session.next_sequence();
            if session.frames_remaining > 0 {
                session.frames_remaining -= 1;
            }

            trace!("Sending frame {} ({} remaining)", seq, session.frames_remaining);
            vec![Effect::Send(HubMessage::audio_data(seq, &frame.samples))]
        }

        AudioEvent::Finished => {
            if !session.connected || !session.hub_available {
                return Vec::new();
            }

            vec![Effect::Send(HubMessage::audio_finished())]
        }
    }
}

/// Hub connection dispatch
pub fn handle_conn_event(session: &mut HubSession, event: ConnEvent, params: &LinkParams) -> Vec<Effect> {
    match event {
        ConnEvent::Sync(info) => {
            if session.hub_available {
                trace!("Already logged in, ignoring synchronization");
                return Vec::new();
            }

            let endpoint = info.endpoint();
            let mut effects = Vec::new();
            if session.connected {
                debug!("Replacing pending connection to {:?}", session.endpoint);
                effects.push(Effect::Disconnect);
            }

            info!("Synchronization received, connecting to hub at {}", endpoint);

            session.connected = true;
            session.endpoint = Some(endpoint);
            effects.push(Effect::Connect(endpoint));
            effects.push(Effect::Send(params.login.to_message()));
            effects
        }

        ConnEvent::LoginAck | ConnEvent::MasterAvailable => {
            if session.connected && !session.hub_available {
                info!("Hub available");
            }
            session.hub_available = session.connected;
            Vec::new()
        }

        ConnEvent::MasterUnavailable => {
            info!("Hub reported unavailable");
            session.hub_available = false;
            session.permission_to_send = false;
            Vec::new()
        }

        ConnEvent::AudioRequest { seconds } => {
            session.permission_to_send = true;
            session.frames_remaining = params.frames_for(seconds);
            info!(
                "Audio requested for {}s ({} frames)",
                seconds, session.frames_remaining
            );
            Vec::new()
        }

        ConnEvent::AudioStop | ConnEvent::StopStreaming => {
            info!("Audio streaming stopped by hub");
            session.permission_to_send = false;
            vec![Effect::Post(AudioEvent::Finished)]
        }

        ConnEvent::StartStreaming => {
            info!("Streaming mode on");
            vec![Effect::Post(AudioEvent::ActivityDetected {
                category: params.streaming_category,
            })]
        }

        ConnEvent::OutputOn => {
            info!("Hub requested output on");
            Vec::new()
        }

        ConnEvent::OutputOff => {
            info!("Hub requested output off");
            Vec::new()
        }

        ConnEvent::AssistantState(state) => {
            debug!("Assistant state: {:?}", state.as_ref());
            Vec::new()
        }

        ConnEvent::Dropped => {
            warn!("Connection to hub dropped");
            let was_connected = session.connected;
            session.drop_connection();
            if was_connected {
                vec![Effect::Disconnect]
            } else {
                Vec::new()
            }
        }
    }
}
