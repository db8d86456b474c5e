/// Hub link runtime
///
/// Owns the `HubSession` and executes the effects produced by the session
/// handlers: connecting, serialized sends, and the receive task that turns
/// inbound frames into connection events.

use super::protocol::{parse_discovery_datagram, HubMessage, Login, ProtocolError, DEVICE_ID_LEN};
use super::session::{
    handle_audio_event, handle_conn_event, AudioEvent, ConnEvent, Effect, HubSession, LinkParams,
};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("Invalid link configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel closed")]
    ChannelClosed,
}

/// Hub link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// UDP port the discovery listener binds
    pub discovery_port: u16,

    /// Multicast group joined for discovery (ignored when not multicast)
    pub multicast_group: Ipv4Addr,

    /// Device category announced at login
    pub device_category_id: u8,

    pub device_identifier: [u8; DEVICE_ID_LEN],

    /// Consecutive read errors tolerated before the session is dropped
    pub read_error_budget: u32,

    pub read_retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            discovery_port: 3333,
            multicast_group: Ipv4Addr::new(239, 0, 0, 21),
            device_category_id: 6,
            device_identifier: [0; DEVICE_ID_LEN],
            read_error_budget: 10,
            read_retry_delay_ms: 200,
            connect_timeout_ms: 5000,
        }
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.read_error_budget == 0 {
            return Err(LinkError::InvalidConfig(
                "read_error_budget must be greater than 0".to_string()
            ));
        }

        if self.connect_timeout_ms == 0 {
            return Err(LinkError::InvalidConfig(
                "connect_timeout_ms must be greater than 0".to_string()
            ));
        }

        Ok(())
    }

    /// Login announcement for a mono stream of `2^frame_size_exponent` sample frames
    pub fn login(&self, frame_size_exponent: u8) -> Login {
        Login {
            device_category_id: self.device_category_id,
            channel_count: 1,
            frame_size_exponent,
            device_identifier: self.device_identifier,
        }
    }
}

/// Serialized writer for outbound messages
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one whole message; concurrent callers never interleave
    async fn send(&self, message: &HubMessage) -> Result<(), LinkError>;

    async fn shutdown(&self);
}

/// `FrameSink` over the write half of a TCP connection
pub struct TcpFrameSink {
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl TcpFrameSink {
    pub fn new(writer: OwnedWriteHalf, peer: SocketAddr) -> Self {
        Self {
            writer: Mutex::new(writer),
            peer,
        }
    }
}

#[async_trait]
impl FrameSink for TcpFrameSink {
    async fn send(&self, message: &HubMessage) -> Result<(), LinkError> {
        let bytes = message.to_bytes()?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;

        trace!("Sent {:?} ({} bytes) to {}", message.kind, bytes.len(), self.peer);
        Ok(())
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
    }
}

/// Channels for talking to a running `HubLink`
#[derive(Clone)]
pub struct HubLinkHandle {
    pub audio_tx: mpsc::UnboundedSender<AudioEvent>,
    pub conn_tx: mpsc::UnboundedSender<ConnEvent>,
    pub state: watch::Receiver<HubSession>,
}

impl HubLinkHandle {
    /// Current session snapshot
    pub fn session(&self) -> HubSession {
        self.state.borrow().clone()
    }
}

struct Connection {
    sink: Arc<dyn FrameSink>,
    reader: JoinHandle<()>,
    generation: u64,
}

/// Hub link event loop
pub struct HubLink {
    config: HubConfig,
    params: LinkParams,
    session: HubSession,
    connection: Option<Connection>,
    generation: u64,
    audio_rx: mpsc::UnboundedReceiver<AudioEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    reader_tx: mpsc::UnboundedSender<(u64, ConnEvent)>,
    reader_rx: mpsc::UnboundedReceiver<(u64, ConnEvent)>,
    state_tx: watch::Sender<HubSession>,
}

impl HubLink {
    pub fn new(config: HubConfig, params: LinkParams) -> (Self, HubLinkHandle) {
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (reader_tx, reader_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(HubSession::new());

        let link = Self {
            config,
            params,
            session: HubSession::new(),
            connection: None,
            generation: 0,
            audio_rx,
            conn_rx,
            reader_tx,
            reader_rx,
            state_tx,
        };

        (link, HubLinkHandle { audio_tx, conn_tx, state })
    }

    /// Process events until every audio sender is dropped
    pub async fn run(mut self) -> Result<(), LinkError> {
        info!("Hub link running");

        loop {
            tokio::select! {
                biased;

                Some((generation, event)) = self.reader_rx.recv() => {
                    if self.connection.as_ref().map(|c| c.generation) != Some(generation) {
                        trace!("Ignoring {:?} from a closed connection", event);
                        continue;
                    }
                    self.dispatch_conn(event).await;
                }

                Some(event) = self.conn_rx.recv() => {
                    self.dispatch_conn(event).await;
                }

                event = self.audio_rx.recv() => match event {
                    Some(event) => {
                        let effects = handle_audio_event(&mut self.session, event);
                        if !self.execute(effects).await && self.session.connected {
                            self.dispatch_conn(ConnEvent::Dropped).await;
                        }
                    }
                    None => break,
                },
            }

            self.state_tx.send_replace(self.session.clone());
        }

        self.disconnect().await;
        info!("Hub link stopped");
        Ok(())
    }

    async fn dispatch_conn(&mut self, event: ConnEvent) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let effects = handle_conn_event(&mut self.session, event, &self.params);
            if !self.execute(effects).await && self.session.connected {
                pending.push_back(ConnEvent::Dropped);
            }
        }
    }

    /// Run effects in order; false when the connection failed along the way
    async fn execute(&mut self, effects: Vec<Effect>) -> bool {
        let mut queue = VecDeque::from(effects);
        let mut healthy = true;

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Connect(addr) => {
                    self.disconnect().await;
                    if let Err(e) = self.connect(addr).await {
                        warn!("Failed to connect to hub at {}: {}", addr, e);
                        healthy = false;
                    }
                }

                Effect::Send(message) => {
                    let Some(connection) = &self.connection else {
                        debug!("No hub connection, dropping {:?}", message.kind);
                        continue;
                    };

                    if let Err(e) = connection.sink.send(&message).await {
                        error!("Send of {:?} failed: {}", message.kind, e);
                        healthy = false;
                    }
                }

                Effect::Post(event) => {
                    let effects = handle_audio_event(&mut self.session, event);
                    queue.extend(effects);
                }

                Effect::Disconnect => self.disconnect().await,
            }
        }

        healthy
    }

    async fn connect(&mut self, addr: SocketAddr) -> Result<(), LinkError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::ConnectTimeout(addr))??;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle: {}", e);
        }

        let (read_half, write_half) = stream.into_split();

        self.generation += 1;
        let generation = self.generation;
        let reader = tokio::spawn(receive_loop(
            read_half,
            generation,
            self.reader_tx.clone(),
            self.config.read_error_budget,
            Duration::from_millis(self.config.read_retry_delay_ms),
        ));

        info!("Connected to hub at {}", addr);

        self.connection = Some(Connection {
            sink: Arc::new(TcpFrameSink::new(write_half, addr)),
            reader,
            generation,
        });

        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.reader.abort();
            connection.sink.shutdown().await;
            debug!("Hub connection closed");
        }
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    generation: u64,
    events: mpsc::UnboundedSender<(u64, ConnEvent)>,
    error_budget: u32,
    retry_delay: Duration,
) {
    let mut buf = BytesMut::with_capacity(1024);
    let mut errors = 0;

    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                info!("Hub closed the connection");
                break;
            }
            Ok(n) => {
                trace!("Received {} bytes", n);
                errors = 0;

                loop {
                    match HubMessage::decode(&mut buf) {
                        Ok(Some(message)) => match ConnEvent::from_message(&message) {
                            Ok(Some(event)) => {
                                if events.send((generation, event)).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => warn!("Unexpected {:?} from hub, dropping", message.kind),
                            Err(e) => warn!("Dropping message: {}", e),
                        },
                        Ok(None) => break,
                        Err(e) => warn!("Dropping frame: {}", e),
                    }
                }
            }
            Err(e) => {
                errors += 1;
                warn!("Read error {}/{}: {}", errors, error_budget, e);
                if errors >= error_budget {
                    error!("Read error budget exhausted, dropping connection");
                    break;
                }
                tokio::time::sleep(retry_delay).await;
            }
        }
    }

    if events.send((generation, ConnEvent::Dropped)).is_err() {
        debug!("Hub link gone, drop of connection {} not reported", generation);
    }
}

/// UDP listener that turns discovery datagrams into `ConnEvent::Sync`
pub struct DiscoveryListener {
    socket: UdpSocket,
}

impl DiscoveryListener {
    pub async fn bind(config: &HubConfig) -> Result<Self, LinkError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.discovery_port)).await?;

        if config.multicast_group.is_multicast() {
            socket.join_multicast_v4(config.multicast_group, Ipv4Addr::UNSPECIFIED)?;
            info!(
                "Listening for hub discovery on {}:{}",
                config.multicast_group, config.discovery_port
            );
        } else {
            info!("Listening for hub discovery on port {}", config.discovery_port);
        }

        Ok(Self { socket })
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }

    /// Forward every valid announcement until the link goes away
    pub async fn run(self, conn_tx: mpsc::UnboundedSender<ConnEvent>) -> Result<(), LinkError> {
        let mut buf = [0u8; 512];

        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;

            match parse_discovery_datagram(&buf[..len]) {
                Ok(info) => {
                    debug!("Discovery from {}: hub at {}", from, info.endpoint());
                    if conn_tx.send(ConnEvent::Sync(info)).is_err() {
                        return Err(LinkError::ChannelClosed);
                    }
                }
                Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use crate::hub::protocol::{audio_request, MessageType, SyncInfo};
    use tokio::net::TcpListener;

    fn params() -> LinkParams {
        LinkParams {
            sample_rate: 16000,
            frame_samples: 4,
            streaming_category: 1,
            login: HubConfig::default().login(2),
        }
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

    async fn wait_for<F: Fn(&HubSession) -> bool>(state: &mut watch::Receiver<HubSession>, f: F) {
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| f(s)))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_config_validation() {
        let mut config = HubConfig::default();
        assert!(config.validate().is_ok());

        config.read_error_budget = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_login_and_stream_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub_addr = listener.local_addr().unwrap();

        let (link, mut handle) = HubLink::new(HubConfig::default(), params());
        let task = tokio::spawn(link.run());

        handle
            .conn_tx
            .send(ConnEvent::Sync(SyncInfo {
                ip: Ipv4Addr::LOCALHOST,
                port: hub_addr.port(),
            }))
            .unwrap();

        let (mut hub, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();

        let login = read_message(&mut hub, &mut buf).await;
        assert_eq!(login.kind, MessageType::Login);
        assert_eq!(Login::parse(&login).unwrap().frame_size_exponent, 2);

        hub.write_all(&HubMessage::empty(MessageType::LoginAck).to_bytes().unwrap())
            .await
            .unwrap();
        hub.write_all(&audio_request(-1).to_bytes().unwrap()).await.unwrap();
        wait_for(&mut handle.state, |s| s.hub_available && s.permission_to_send).await;

        handle.audio_tx.send(AudioEvent::ActivityDetected { category: 3 }).unwrap();
        handle
            .audio_tx
            .send(AudioEvent::Frame(AudioFrame::new(0, vec![1, 2, 3, 4])))
            .unwrap();
        handle.audio_tx.send(AudioEvent::Finished).unwrap();

        let detected = read_message(&mut hub, &mut buf).await;
        assert_eq!(detected, HubMessage::audio_detected(0, 3));
        let data = read_message(&mut hub, &mut buf).await;
        assert_eq!(data, HubMessage::audio_data(1, &[1, 2, 3, 4]));
        let finished = read_message(&mut hub, &mut buf).await;
        assert_eq!(finished.kind, MessageType::AudioFinished);

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_hub_close_resets_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hub_addr = listener.local_addr().unwrap();

        let (link, mut handle) = HubLink::new(HubConfig::default(), params());
        tokio::spawn(link.run());

        handle
            .conn_tx
            .send(ConnEvent::Sync(SyncInfo {
                ip: Ipv4Addr::LOCALHOST,
                port: hub_addr.port(),
            }))
            .unwrap();

        let (mut hub, _) = listener.accept().await.unwrap();
        hub.write_all(&HubMessage::empty(MessageType::MasterAvailable).to_bytes().unwrap())
            .await
            .unwrap();
        wait_for(&mut handle.state, |s| s.hub_available).await;

        drop(hub);
        wait_for(&mut handle.state, |s| !s.connected).await;

        let session = handle.session();
        assert!(!session.hub_available);
        assert!(!session.permission_to_send);
        assert_eq!(session.frames_remaining, -1);
    }

    #[tokio::test]
    async fn test_unreachable_hub_drops_session() {
        // Bind then release a port so nothing is listening on it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (link, mut handle) = HubLink::new(HubConfig::default(), params());
        tokio::spawn(link.run());

        handle
            .conn_tx
            .send(ConnEvent::Sync(SyncInfo { ip: Ipv4Addr::LOCALHOST, port }))
            .unwrap();

        // One snapshot is published per processed event
        tokio::time::timeout(Duration::from_secs(5), handle.state.changed())
            .await
            .unwrap()
            .unwrap();

        let session = handle.session();
        assert!(!session.connected);
        assert!(session.endpoint.is_none());
        assert!(!session.hub_available);
    }

    #[tokio::test]
    async fn test_receive_loop_reports_drop_with_generation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (mut hub, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = client.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(receive_loop(read_half, 7, tx, 3, Duration::from_millis(1)));

        hub.write_all(&HubMessage::empty(MessageType::MasterAvailable).to_bytes().unwrap())
            .await
            .unwrap();
        drop(hub);

        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 7);
        assert!(matches!(event, ConnEvent::MasterAvailable));

        let (generation, event) = rx.recv().await.unwrap();
        assert_eq!(generation, 7);
        assert!(matches!(event, ConnEvent::Dropped));

        tokio::time::timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_receive_loop_ends_when_link_is_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (hub, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = client.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        drop(hub);

        // The drop report has nowhere to go; the reader still finishes
        tokio::time::timeout(
            Duration::from_secs(5),
            receive_loop(read_half, 1, tx, 3, Duration::from_millis(1)),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_discovery_forwards_sync() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = DiscoveryListener::from_socket(socket);
        let addr = listener.local_addr().unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(listener.run(tx));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", addr).await.unwrap();

        let sync = SyncInfo { ip: Ipv4Addr::new(10, 1, 2, 3), port: 7000 };
        sender
            .send_to(&sync.to_message().to_bytes().unwrap(), addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ConnEvent::Sync(sync));
    }
}
