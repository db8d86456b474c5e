/// Integration tests for the keyword node
///
/// Drives the full pipeline (capture, ring, feature window, gate,
/// classifier, recognizer) with synthetic tone traces, and the hub link
/// against a fake hub on loopback.

use bytes::BytesMut;
use keyword_node::hub::{handle_audio_event, Effect, Login, SyncInfo};
use keyword_node::{
    link_params, AudioEvent, CaptureWorker, Classifier, ClassifierError, ConnEvent, FilterbankFrontend,
    HubConfig, HubLink, HubMessage, HubSession, KeywordNode, MessageType, Microphone, NodeConfig,
    Responder, StreamConfig, TickOutcome, WavMicrophone,
};
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const SAMPLE_RATE: u32 = 16000;
const STRIDE: usize = 320;

const WAKE_HZ: f32 = 2000.0;
const COMMAND_HZ: f32 = 3000.0;

/// Generate a sine tone of `blocks` strides
fn tone(frequency: f32, blocks: usize, amplitude: f32) -> Vec<i16> {
    (0..blocks * STRIDE)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (amplitude * (2.0 * PI * frequency * t).sin() * i16::MAX as f32) as i16
        })
        .collect()
}

/// Silence, then the wake word, then the command
fn command_trace() -> Vec<i16> {
    let mut trace = vec![0i16; 32 * STRIDE];
    trace.extend(tone(WAKE_HZ, 33, 0.3));
    trace.extend(tone(COMMAND_HZ, 33, 0.3));
    trace
}

/// Classifier that recognizes the two test tones by their loudest bin
struct ToneClassifier {
    bins: usize,
    slices: usize,
    categories: usize,
    wake_index: usize,
    command_index: usize,
    null_index: usize,
    centers: Vec<f32>,
}

impl ToneClassifier {
    fn new(config: &NodeConfig, command: &str) -> Self {
        let settings = &config.model;
        let frontend =
            FilterbankFrontend::new(settings.sample_rate, settings.feature_slice_size, &config.features).unwrap();

        Self {
            bins: settings.feature_slice_size,
            slices: settings.feature_slice_count,
            categories: settings.category_count(),
            wake_index: settings.wake_word_index,
            command_index: settings.index_of(command).unwrap(),
            null_index: settings.index_of("null").unwrap(),
            centers: frontend.center_frequencies().to_vec(),
        }
    }

    /// Vote of one feature slice: wake, command or nothing
    fn vote(&self, slice: &[i8]) -> Option<usize> {
        let (peak, &level) = slice.iter().enumerate().max_by_key(|(_, v)| **v)?;
        if level <= 0 {
            return None;
        }

        let center = self.centers[peak];
        if (center - WAKE_HZ).abs() < (center - COMMAND_HZ).abs() {
            Some(self.wake_index)
        } else {
            Some(self.command_index)
        }
    }
}

impl Classifier for ToneClassifier {
    fn input_len(&self) -> usize {
        self.bins * self.slices
    }

    fn output_len(&self) -> usize {
        self.categories
    }

    fn infer(&mut self, input: &[i8], output: &mut [i8]) -> Result<(), ClassifierError> {
        let mut votes = vec![0usize; self.categories];
        for slice in input.chunks_exact(self.bins).rev().take(5) {
            if let Some(index) = self.vote(slice) {
                votes[index] += 1;
            }
        }

        let winner = (0..self.categories)
            .find(|&i| votes[i] >= 3)
            .unwrap_or(self.null_index);

        output.fill(i8::MIN);
        output[winner] = i8::MAX;
        Ok(())
    }
}

/// Responder recording every category it is asked to act on
#[derive(Clone, Default)]
struct RecordingResponder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl Responder for RecordingResponder {
    fn respond(&mut self, category: &str) {
        self.seen.lock().push(category.to_string());
    }
}

/// Scripted microphone delivering a fixed trace
struct TraceMic {
    samples: Vec<i16>,
    position: usize,
}

impl Microphone for TraceMic {
    fn read_block(&mut self, buf: &mut [i16]) -> Result<usize, keyword_node::CaptureError> {
        let n = buf.len().min(self.samples.len() - self.position);
        buf[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

fn pipeline_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.capture.block_samples = STRIDE;
    config.features.read_timeout_ms = 0;
    config.gate.min_power = 0.0;
    config.recognizer.average_window_duration_ms = 60;
    config.stream = StreamConfig {
        frame_size_exponent: 9,
        frames: 4,
    };
    config
}

/// Step the capture worker one block at a time, ticking after each
fn drive(node: &mut KeywordNode, config: &NodeConfig, mic: &mut dyn Microphone, blocks: usize) -> Vec<TickOutcome> {
    let mut worker = CaptureWorker::new(config.capture.clone(), Arc::clone(node.ring()), Arc::clone(node.clock()));
    let orchestrator = node.orchestrator_mut().unwrap();

    (0..blocks)
        .map(|_| {
            worker.step(mic);
            orchestrator.tick()
        })
        .collect()
}

fn new_commands(outcomes: &[TickOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .filter_map(|o| match o {
            TickOutcome::Scored(r) if r.is_new_command => Some(r.category.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_wake_then_command_end_to_end() {
    let config = pipeline_config();
    let classifier = ToneClassifier::new(&config, "enciende");
    let responder = RecordingResponder::default();
    let heard = Arc::new(Mutex::new(Vec::new()));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let callback_log = Arc::clone(&heard);
    let mut node = KeywordNode::new(config.clone(), Box::new(classifier), Box::new(responder.clone()))
        .unwrap()
        .with_events(events_tx)
        .with_callback(Box::new(move |category, power| {
            callback_log.lock().push((category.to_string(), power));
        }));

    let trace = command_trace();
    let blocks = trace.len() / STRIDE;
    let mut mic = TraceMic {
        samples: trace,
        position: 0,
    };
    let outcomes = drive(&mut node, &config, &mut mic, blocks);

    // Silence never reaches the classifier
    assert!(outcomes[..32].iter().all(|o| !matches!(o, TickOutcome::Scored(_))));

    assert_eq!(new_commands(&outcomes), vec!["enciende".to_string()]);
    assert_eq!(*responder.seen.lock(), vec!["enciende".to_string()]);

    let heard = heard.lock();
    assert_eq!(heard.len(), 1);
    assert_eq!(heard[0].0, "enciende");
    assert!(heard[0].1 > 0.0);

    let stats = node.orchestrator_mut().unwrap().stats().clone();
    assert_eq!(stats.commands, 1);
    assert_eq!(stats.activations, 1);
    assert!(stats.gated > 0);

    // Streamed to a hub that is available and has granted permission
    let mut session = HubSession {
        connected: true,
        hub_available: true,
        permission_to_send: true,
        ..HubSession::default()
    };

    let mut sent = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        for effect in handle_audio_event(&mut session, event) {
            match effect {
                Effect::Send(message) => sent.push(message),
                other => panic!("unexpected effect {:?}", other),
            }
        }
    }

    let kinds: Vec<MessageType> = sent.iter().map(|m| m.kind).collect();
    let mut expected = Vec::new();
    for _ in 0..2 {
        expected.push(MessageType::AudioDetected);
        expected.extend([MessageType::AudioData; 4]);
        expected.push(MessageType::AudioFinished);
    }
    assert_eq!(kinds, expected);

    // Wake word first, then the command
    assert_eq!(sent[0].payload[1], 1);
    assert_eq!(sent[6].payload[1], 3);
    assert!(sent.iter().filter(|m| m.kind == MessageType::AudioData).all(|m| m.payload.len() == 1 + 512 * 2));
}

#[test]
fn test_command_without_wake_word_is_ignored() {
    let config = pipeline_config();
    let classifier = ToneClassifier::new(&config, "enciende");
    let responder = RecordingResponder::default();

    let mut node = KeywordNode::new(config.clone(), Box::new(classifier), Box::new(responder.clone())).unwrap();

    let mut trace = vec![0i16; 32 * STRIDE];
    trace.extend(tone(COMMAND_HZ, 40, 0.3));
    let blocks = trace.len() / STRIDE;
    let mut mic = TraceMic {
        samples: trace,
        position: 0,
    };

    let outcomes = drive(&mut node, &config, &mut mic, blocks);

    assert!(new_commands(&outcomes).is_empty());
    assert!(responder.seen.lock().is_empty());
    assert!(outcomes.iter().any(|o| matches!(o, TickOutcome::Scored(_))));
}

#[test]
fn test_wav_replay_selects_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.wav");

    // Left channel silent, right channel carries the command trace
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let trace = command_trace();
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for &sample in &trace {
        writer.write_sample(0i16).unwrap();
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();

    let mut config = pipeline_config();
    config.capture.channels = 2;
    config.capture.channel_select = 1;

    let classifier = ToneClassifier::new(&config, "apaga");
    let responder = RecordingResponder::default();
    let mut node = KeywordNode::new(config.clone(), Box::new(classifier), Box::new(responder.clone())).unwrap();

    let mut mic = WavMicrophone::open(&path).unwrap().unpaced();
    assert_eq!(mic.channels(), 2);

    let outcomes = drive(&mut node, &config, &mut mic, trace.len() / STRIDE);

    assert_eq!(new_commands(&outcomes), vec!["apaga".to_string()]);
    assert_eq!(node.clock().total_samples(), trace.len() as u64);
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.json");

    let mut config = NodeConfig::default();
    config.hub.discovery_port = 4444;
    config.recognizer.timeout_ms = 1500;
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let loaded = NodeConfig::from_file(&path).unwrap();
    assert_eq!(loaded.hub.discovery_port, 4444);
    assert_eq!(loaded.recognizer.timeout_ms, 1500);
    assert!(loaded.validate().is_ok());
}

async fn read_message(stream: &mut TcpStream, buf: &mut BytesMut) -> HubMessage {
    loop {
        if let Some(message) = HubMessage::decode(buf).unwrap() {
            return message;
        }
        let n = stream.read_buf(buf).await.unwrap();
        assert!(n > 0, "connection closed");
    }
}

#[tokio::test]
async fn test_detection_streams_to_hub() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_addr = listener.local_addr().unwrap();

    let mut config = NodeConfig::default();
    config.hub.device_identifier = [1, 2, 3, 4, 5, 6];
    let (link, mut handle) = HubLink::new(config.hub.clone(), link_params(&config));
    let task = tokio::spawn(link.run());

    // Announce the hub the way discovery would
    let sync = SyncInfo {
        ip: Ipv4Addr::LOCALHOST,
        port: hub_addr.port(),
    };
    handle.conn_tx.send(ConnEvent::Sync(sync)).unwrap();

    let (mut hub, _) = listener.accept().await.unwrap();
    let mut buf = BytesMut::new();

    let login = Login::parse(&read_message(&mut hub, &mut buf).await).unwrap();
    assert_eq!(login.device_identifier, [1, 2, 3, 4, 5, 6]);
    assert_eq!(login.frame_size_exponent, 9);

    hub.write_all(&HubMessage::empty(MessageType::LoginAck).to_bytes().unwrap())
        .await
        .unwrap();
    hub.write_all(&keyword_node::hub::protocol::audio_request(1).to_bytes().unwrap())
        .await
        .unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        handle.state.wait_for(|s| s.hub_available && s.permission_to_send),
    )
    .await
    .unwrap()
    .unwrap();

    // One second at 512-sample frames
    assert_eq!(handle.session().frames_remaining, 31);

    handle.audio_tx.send(AudioEvent::ActivityDetected { category: 3 }).unwrap();
    for _ in 0..2 {
        handle
            .audio_tx
            .send(AudioEvent::Frame(keyword_node::AudioFrame::new(0, vec![5; 512])))
            .unwrap();
    }
    handle.audio_tx.send(AudioEvent::Finished).unwrap();

    let detected = read_message(&mut hub, &mut buf).await;
    assert_eq!(detected.kind, MessageType::AudioDetected);
    assert_eq!(detected.payload[1], 3);

    for _ in 0..2 {
        let data = read_message(&mut hub, &mut buf).await;
        assert_eq!(data.kind, MessageType::AudioData);
        assert_eq!(data.payload.len(), 1 + 1024);
    }

    let finished = read_message(&mut hub, &mut buf).await;
    assert_eq!(finished.kind, MessageType::AudioFinished);

    drop(handle);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_hub_drop_allows_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let hub_addr = listener.local_addr().unwrap();

    let (link, mut handle) = HubLink::new(HubConfig::default(), link_params(&NodeConfig::default()));
    tokio::spawn(link.run());

    let sync = SyncInfo {
        ip: Ipv4Addr::LOCALHOST,
        port: hub_addr.port(),
    };
    handle.conn_tx.send(ConnEvent::Sync(sync)).unwrap();

    let (mut hub, _) = listener.accept().await.unwrap();
    let mut buf = BytesMut::new();
    assert_eq!(read_message(&mut hub, &mut buf).await.kind, MessageType::Login);

    hub.write_all(&HubMessage::empty(MessageType::MasterAvailable).to_bytes().unwrap())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.state.wait_for(|s| s.hub_available))
        .await
        .unwrap()
        .unwrap();

    drop(hub);
    tokio::time::timeout(Duration::from_secs(5), handle.state.wait_for(|s| !s.connected))
        .await
        .unwrap()
        .unwrap();

    // The next announcement reconnects and logs in again
    handle.conn_tx.send(ConnEvent::Sync(sync)).unwrap();
    let (mut hub, _) = listener.accept().await.unwrap();
    let mut buf = BytesMut::new();
    assert_eq!(read_message(&mut hub, &mut buf).await.kind, MessageType::Login);
}
