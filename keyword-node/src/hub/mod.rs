/// Hub link
///
/// Framed binary protocol, the session state machine, and the tokio runtime
/// that connects to the hub found through discovery.

pub mod link;
pub mod protocol;
pub mod session;

pub use link::{DiscoveryListener, FrameSink, HubConfig, HubLink, HubLinkHandle, LinkError, TcpFrameSink};
pub use protocol::{HubMessage, Login, MessageType, ProtocolError, SyncInfo};
pub use session::{
    handle_audio_event, handle_conn_event, AudioEvent, ConnEvent, Effect, HubSession, LinkParams,
};
