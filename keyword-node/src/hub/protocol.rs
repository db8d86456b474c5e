/// Hub wire protocol
///
/// Every message is `[type:1][length:2 big-endian][payload]`, where the
/// length counts the whole message including the 3-byte header. The same
/// framing is used on the TCP link and in discovery datagrams.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Type byte plus two length bytes
pub const HEADER_LEN: usize = 3;

/// Largest encodable message (header included)
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

/// Bytes in a device identifier
pub const DEVICE_ID_LEN: usize = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(u8),

    #[error("Invalid message length: {0}")]
    InvalidLength(usize),

    #[error("Message of {0} bytes exceeds the 16-bit length field")]
    TooLarge(usize),

    #[error("Truncated message: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("Malformed {kind:?} payload: {reason}")]
    Malformed { kind: MessageType, reason: String },
}

/// Message type table
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    AudioDetected = 0,
    AudioFinished = 1,
    AudioData = 2,
    Synchronization = 3,
    AudioRequest = 4,
    MasterAvailable = 5,
    MasterUnavailable = 6,
    AudioStop = 7,
    OutputOn = 8,
    OutputOff = 9,
    LocationInfo = 10,
    Login = 11,
    /// The hub's identity reply, which acknowledges a login
    LoginAck = 12,
    IdAck = 13,
    RefPetition = 14,
    RefAnswer = 15,
    AssistantState = 16,
    StartOfStreamingMode = 17,
    StopOfStreamingMode = 18,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => MessageType::AudioDetected,
            1 => MessageType::AudioFinished,
            2 => MessageType::AudioData,
            3 => MessageType::Synchronization,
            4 => MessageType::AudioRequest,
            5 => MessageType::MasterAvailable,
            6 => MessageType::MasterUnavailable,
            7 => MessageType::AudioStop,
            8 => MessageType::OutputOn,
            9 => MessageType::OutputOff,
            10 => MessageType::LocationInfo,
            11 => MessageType::Login,
            12 => MessageType::LoginAck,
            13 => MessageType::IdAck,
            14 => MessageType::RefPetition,
            15 => MessageType::RefAnswer,
            16 => MessageType::AssistantState,
            17 => MessageType::StartOfStreamingMode,
            18 => MessageType::StopOfStreamingMode,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        kind as u8
    }
}

/// One framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubMessage {
    pub kind: MessageType,
    pub payload: Bytes,
}

impl HubMessage {
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Message without payload
    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Value of the length field
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.encoded_len();
        if len > MAX_MESSAGE_LEN {
            return Err(ProtocolError::TooLarge(len));
        }

        dst.reserve(len);
        dst.put_u8(self.kind.into());
        dst.put_u16(len as u16);
        dst.put_slice(&self.payload);

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Take one complete message off the front of `src`
    ///
    /// Returns `Ok(None)` until a whole message is buffered. A frame with an
    /// unknown type or an impossible length is consumed before the error is
    /// returned, so the caller can keep decoding.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if len < HEADER_LEN {
            src.advance(HEADER_LEN);
            return Err(ProtocolError::InvalidLength(len));
        }

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len).freeze();
        let kind = MessageType::try_from(frame[0])?;

        Ok(Some(Self {
            kind,
            payload: frame.slice(HEADER_LEN..),
        }))
    }

    /// Decode a message that must fill `buf` exactly (one datagram)
    pub fn decode_datagram(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut src = BytesMut::from(buf);

        match Self::decode(&mut src)? {
            Some(message) if src.is_empty() => Ok(message),
            Some(message) => Err(ProtocolError::InvalidLength(message.encoded_len())),
            None => {
                let need = if buf.len() >= HEADER_LEN {
                    u16::from_be_bytes([buf[1], buf[2]]) as usize
                } else {
                    HEADER_LEN
                };
                Err(ProtocolError::Truncated { need, got: buf.len() })
            }
        }
    }

    /// `[seq][category]`
    pub fn audio_detected(seq: u8, category: u8) -> Self {
        Self::new(MessageType::AudioDetected, vec![seq, category])
    }

    pub fn audio_finished() -> Self {
        Self::empty(MessageType::AudioFinished)
    }

    /// `[seq][PCM s16le]`
    pub fn audio_data(seq: u8, samples: &[i16]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + samples.len() * 2);
        payload.put_u8(seq);
        for &sample in samples {
            payload.put_i16_le(sample);
        }

        Self::new(MessageType::AudioData, payload.freeze())
    }

    fn malformed(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::Malformed {
            kind: self.kind,
            reason: reason.into(),
        }
    }
}

/// Login announcement sent right after connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Login {
    pub device_category_id: u8,
    pub channel_count: u8,
    pub frame_size_exponent: u8,
    pub device_identifier: [u8; DEVICE_ID_LEN],
}

impl Login {
    const PAYLOAD_LEN: usize = 3 + DEVICE_ID_LEN;

    pub fn to_message(&self) -> HubMessage {
        let mut payload = BytesMut::with_capacity(Self::PAYLOAD_LEN);
        payload.put_u8(self.device_category_id);
        payload.put_u8(self.channel_count);
        payload.put_u8(self.frame_size_exponent);
        payload.put_slice(&self.device_identifier);

        HubMessage::new(MessageType::Login, payload.freeze())
    }

    pub fn parse(message: &HubMessage) -> Result<Self, ProtocolError> {
        if message.kind != MessageType::Login {
            return Err(message.malformed("not a login message"));
        }

        let mut payload = message.payload.clone();
        if payload.len() != Self::PAYLOAD_LEN {
            return Err(message.malformed(format!(
                "{} payload bytes, want {}",
                payload.len(),
                Self::PAYLOAD_LEN
            )));
        }

        let device_category_id = payload.get_u8();
        let channel_count = payload.get_u8();
        let frame_size_exponent = payload.get_u8();
        let mut device_identifier = [0u8; DEVICE_ID_LEN];
        payload.copy_to_slice(&mut device_identifier);

        Ok(Self {
            device_category_id,
            channel_count,
            frame_size_exponent,
            device_identifier,
        })
    }
}

/// Hub endpoint announced by a synchronization message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncInfo {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl SyncInfo {
    /// `[port u16 LE][ip ASCII]`, trailing NULs allowed
    pub fn parse(message: &HubMessage) -> Result<Self, ProtocolError> {
        if message.kind != MessageType::Synchronization {
            return Err(message.malformed("not a synchronization message"));
        }

        let payload = &message.payload;
        if payload.len() < 3 {
            return Err(message.malformed("missing port or address"));
        }

        let port = u16::from_le_bytes([payload[0], payload[1]]);
        let text = std::str::from_utf8(&payload[2..])
            .map_err(|_| message.malformed("address is not ASCII"))?;
        let ip = text
            .trim_end_matches('\0')
            .trim()
            .parse()
            .map_err(|_| message.malformed(format!("bad address {:?}", text)))?;

        Ok(Self { ip, port })
    }

    pub fn to_message(&self) -> HubMessage {
        let ip = self.ip.to_string();
        let mut payload = BytesMut::with_capacity(2 + ip.len());
        payload.put_u16_le(self.port);
        payload.put_slice(ip.as_bytes());

        HubMessage::new(MessageType::Synchronization, payload.freeze())
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

/// Requested streaming duration in seconds (negative means unbounded)
pub fn parse_audio_request(message: &HubMessage) -> Result<i32, ProtocolError> {
    if message.payload.len() < 4 {
        return Err(message.malformed(format!(
            "{} payload bytes, want 4",
            message.payload.len()
        )));
    }

    let mut payload = message.payload.clone();
    Ok(payload.get_i32_le())
}

pub fn audio_request(seconds: i32) -> HubMessage {
    HubMessage::new(MessageType::AudioRequest, seconds.to_le_bytes().to_vec())
}

/// Hub endpoint from a discovery datagram (one framed synchronization message)
pub fn parse_discovery_datagram(buf: &[u8]) -> Result<SyncInfo, ProtocolError> {
    let message = HubMessage::decode_datagram(buf)?;
    SyncInfo::parse(&message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_round_trip() {
        let login = Login {
            device_category_id: 6,
            channel_count: 1,
            frame_size_exponent: 9,
            device_identifier: [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01],
        };

        let bytes = login.to_message().to_bytes().unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[11, 0, 12, 6, 1, 9, 0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]
        );

        let mut src = BytesMut::from(bytes.as_ref());
        let message = HubMessage::decode(&mut src).unwrap().unwrap();
        assert_eq!(message.kind, MessageType::Login);
        assert_eq!(message.encoded_len(), 12);
        assert_eq!(Login::parse(&message).unwrap(), login);
        assert!(src.is_empty());
    }

    #[test]
    fn test_audio_detected_layout() {
        let bytes = HubMessage::audio_detected(7, 3).to_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 5, 7, 3]);

        let bytes = HubMessage::audio_finished().to_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[1, 0, 3]);
    }

    #[test]
    fn test_audio_data_little_endian() {
        let bytes = HubMessage::audio_data(2, &[1, -2]).to_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[2, 0, 8, 2, 1, 0, 0xfe, 0xff]);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let bytes = HubMessage::audio_data(0, &[5; 100]).to_bytes().unwrap();
        let mut src = BytesMut::new();

        src.extend_from_slice(&bytes[..2]);
        assert_eq!(HubMessage::decode(&mut src).unwrap(), None);

        src.extend_from_slice(&bytes[2..50]);
        assert_eq!(HubMessage::decode(&mut src).unwrap(), None);

        src.extend_from_slice(&bytes[50..]);
        let message = HubMessage::decode(&mut src).unwrap().unwrap();
        assert_eq!(message.payload.len(), 201);
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut src = BytesMut::new();
        HubMessage::empty(MessageType::MasterAvailable).encode(&mut src).unwrap();
        audio_request(-1).encode(&mut src).unwrap();

        let first = HubMessage::decode(&mut src).unwrap().unwrap();
        let second = HubMessage::decode(&mut src).unwrap().unwrap();

        assert_eq!(first.kind, MessageType::MasterAvailable);
        assert_eq!(second.kind, MessageType::AudioRequest);
        assert_eq!(parse_audio_request(&second).unwrap(), -1);
        assert!(src.is_empty());
    }

    #[test]
    fn test_unknown_type_consumed() {
        let mut src = BytesMut::from(&[42u8, 0, 4, 9, 5, 0, 3][..]);

        assert_eq!(HubMessage::decode(&mut src), Err(ProtocolError::UnknownType(42)));
        let next = HubMessage::decode(&mut src).unwrap().unwrap();
        assert_eq!(next.kind, MessageType::MasterAvailable);
    }

    #[test]
    fn test_invalid_length_rejected() {
        let mut src = BytesMut::from(&[5u8, 0, 1][..]);
        assert_eq!(HubMessage::decode(&mut src), Err(ProtocolError::InvalidLength(1)));
        assert!(src.is_empty());
    }

    #[test]
    fn test_sync_info_parse() {
        let sync = SyncInfo {
            ip: Ipv4Addr::new(192, 168, 1, 20),
            port: 5000,
        };
        let message = sync.to_message();
        assert_eq!(&message.payload[..2], &[0x88, 0x13]);
        assert_eq!(SyncInfo::parse(&message).unwrap(), sync);

        let padded = HubMessage::new(MessageType::Synchronization, &b"\x88\x1310.0.0.1\0\0"[..]);
        assert_eq!(
            SyncInfo::parse(&padded).unwrap().endpoint(),
            "10.0.0.1:5000".parse::<SocketAddr>().unwrap()
        );

        let bad = HubMessage::new(MessageType::Synchronization, &b"\x88\x13hub"[..]);
        assert!(SyncInfo::parse(&bad).is_err());
    }

    #[test]
    fn test_datagram_must_be_exact() {
        let bytes = SyncInfo { ip: Ipv4Addr::LOCALHOST, port: 1 }
            .to_message()
            .to_bytes()
            .unwrap();

        assert_eq!(parse_discovery_datagram(&bytes).unwrap().port, 1);
        assert!(matches!(
            HubMessage::decode_datagram(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }
}
