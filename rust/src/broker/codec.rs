//! MQTT 3.1.1 subset used by broker clients.
//!
//! Supports CONNECT/CONNACK, PUBLISH (QoS 0 and 1) with PUBACK,
//! SUBSCRIBE/SUBACK, UNSUBSCRIBE/UNSUBACK, PINGREQ/PINGRESP and DISCONNECT.
//! The codec is symmetric so the same type drives test clients.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

pub const MAX_PACKET_SIZE: usize = 1_048_576;

/// Largest value the 4-byte remaining-length field can carry.
const MAX_REMAINING_LENGTH: usize = 268_435_455;

pub const CONNACK_ACCEPTED: u8 = 0x00;
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed remaining length")]
    MalformedLength,
    #[error("packet of {size} bytes exceeds limit of {max}")]
    PacketTooLarge { size: usize, max: usize },
    #[error("unsupported packet type {0}")]
    UnsupportedPacket(u8),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
}

// ---------------------------------------------------------------------------
// Packets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_level: u8,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<Bytes>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, username: Option<&str>) -> Self {
        Self {
            protocol_level: 4,
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: 60,
            username: username.map(|u| Bytes::copy_from_slice(u.as_bytes())),
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: u8,
    pub retain: bool,
    pub topic: Bytes,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn qos0(topic: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: 0,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe { packet_id: u16, filters: Vec<(String, u8)> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    Unsubscribe { packet_id: u16, topics: Vec<String> },
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Connect),
            2 => Some(Self::ConnAck),
            3 => Some(Self::Publish),
            4 => Some(Self::PubAck),
            8 => Some(Self::Subscribe),
            9 => Some(Self::SubAck),
            10 => Some(Self::Unsubscribe),
            11 => Some(Self::UnsubAck),
            12 => Some(Self::PingReq),
            13 => Some(Self::PingResp),
            14 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if src.len() < 2 {
            return Ok(None);
        }

        // Fixed header: 1 type byte + 1..=4 remaining-length bytes.
        let mut remaining = 0usize;
        let mut multiplier = 1usize;
        let mut pos = 1;
        loop {
            if pos > 4 {
                return Err(CodecError::MalformedLength);
            }
            if pos >= src.len() {
                return Ok(None);
            }
            let byte = src[pos];
            remaining += (byte & 0x7f) as usize * multiplier;
            multiplier *= 128;
            pos += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }

        let total = pos + remaining;
        if total > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: total,
                max: self.max_packet_size,
            });
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let header = src[0];
        src.advance(pos);
        let body = src.split_to(remaining).freeze();
        parse_packet(header, body).map(Some)
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut body = BytesMut::new();
        let header = match packet {
            Packet::Connect(connect) => {
                put_string(&mut body, "MQTT");
                body.put_u8(connect.protocol_level);
                let mut flags = 0u8;
                if connect.clean_session {
                    flags |= 0x02;
                }
                if connect.username.is_some() {
                    flags |= 0x80;
                }
                if connect.password.is_some() {
                    flags |= 0x40;
                }
                body.put_u8(flags);
                body.put_u16(connect.keep_alive);
                put_string(&mut body, &connect.client_id);
                if let Some(username) = &connect.username {
                    put_binary(&mut body, username);
                }
                if let Some(password) = &connect.password {
                    put_binary(&mut body, password);
                }
                (PacketType::Connect as u8) << 4
            }
            Packet::ConnAck {
                session_present,
                code,
            } => {
                body.put_u8(u8::from(session_present));
                body.put_u8(code);
                (PacketType::ConnAck as u8) << 4
            }
            Packet::Publish(publish) => {
                put_binary(&mut body, &publish.topic);
                if publish.qos > 0 {
                    body.put_u16(publish.packet_id.unwrap_or(0));
                }
                body.put_slice(&publish.payload);
                let mut header = (PacketType::Publish as u8) << 4;
                if publish.dup {
                    header |= 0x08;
                }
                header |= (publish.qos & 0x03) << 1;
                if publish.retain {
                    header |= 0x01;
                }
                header
            }
            Packet::PubAck { packet_id } => {
                body.put_u16(packet_id);
                (PacketType::PubAck as u8) << 4
            }
            Packet::Subscribe { packet_id, filters } => {
                body.put_u16(packet_id);
                for (topic, qos) in &filters {
                    put_string(&mut body, topic);
                    body.put_u8(*qos);
                }
                ((PacketType::Subscribe as u8) << 4) | 0x02
            }
            Packet::SubAck { packet_id, codes } => {
                body.put_u16(packet_id);
                body.put_slice(&codes);
                (PacketType::SubAck as u8) << 4
            }
            Packet::Unsubscribe { packet_id, topics } => {
                body.put_u16(packet_id);
                for topic in &topics {
                    put_string(&mut body, topic);
                }
                ((PacketType::Unsubscribe as u8) << 4) | 0x02
            }
            Packet::UnsubAck { packet_id } => {
                body.put_u16(packet_id);
                (PacketType::UnsubAck as u8) << 4
            }
            Packet::PingReq => (PacketType::PingReq as u8) << 4,
            Packet::PingResp => (PacketType::PingResp as u8) << 4,
            Packet::Disconnect => (PacketType::Disconnect as u8) << 4,
        };

        if body.len() > MAX_REMAINING_LENGTH || body.len() + 5 > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: body.len(),
                max: self.max_packet_size,
            });
        }
        dst.reserve(5 + body.len());
        dst.put_u8(header);
        put_remaining_length(dst, body.len());
        dst.put_slice(&body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_packet(header: u8, mut body: Bytes) -> Result<Packet, CodecError> {
    let raw_type = header >> 4;
    let flags = header & 0x0f;
    let packet_type =
        PacketType::from_u8(raw_type).ok_or(CodecError::UnsupportedPacket(raw_type))?;

    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(parse_connect(&mut body)?),
        PacketType::ConnAck => {
            let ack_flags = read_u8(&mut body)?;
            let code = read_u8(&mut body)?;
            Packet::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code,
            }
        }
        PacketType::Publish => Packet::Publish(parse_publish(flags, &mut body)?),
        PacketType::PubAck => Packet::PubAck {
            packet_id: read_u16(&mut body)?,
        },
        PacketType::Subscribe => {
            if flags != 0x02 {
                return Err(CodecError::Malformed("bad SUBSCRIBE flags"));
            }
            let packet_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let topic = read_string(&mut body)?;
                let qos = read_u8(&mut body)?;
                filters.push((topic, qos));
            }
            if filters.is_empty() {
                return Err(CodecError::Malformed("SUBSCRIBE without topics"));
            }
            Packet::Subscribe { packet_id, filters }
        }
        PacketType::SubAck => {
            let packet_id = read_u16(&mut body)?;
            let codes = body.split_to(body.len()).to_vec();
            Packet::SubAck { packet_id, codes }
        }
        PacketType::Unsubscribe => {
            if flags != 0x02 {
                return Err(CodecError::Malformed("bad UNSUBSCRIBE flags"));
            }
            let packet_id = read_u16(&mut body)?;
            let mut topics = Vec::new();
            while body.has_remaining() {
                topics.push(read_string(&mut body)?);
            }
            if topics.is_empty() {
                return Err(CodecError::Malformed("UNSUBSCRIBE without topics"));
            }
            Packet::Unsubscribe { packet_id, topics }
        }
        PacketType::UnsubAck => Packet::UnsubAck {
            packet_id: read_u16(&mut body)?,
        },
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    if body.has_remaining() {
        return Err(CodecError::Malformed("trailing bytes"));
    }
    Ok(packet)
}

fn parse_connect(body: &mut Bytes) -> Result<Connect, CodecError> {
    let protocol = read_string(body)?;
    let protocol_level = read_u8(body)?;
    match (protocol.as_str(), protocol_level) {
        ("MQTT", 4) | ("MQIsdp", 3) => {}
        _ => return Err(CodecError::Malformed("unsupported protocol")),
    }
    let flags = read_u8(body)?;
    if flags & 0x01 != 0 {
        return Err(CodecError::Malformed("reserved CONNECT flag set"));
    }
    let keep_alive = read_u16(body)?;
    let client_id = read_string(body)?;

    // Will messages are accepted on the wire but not retained.
    if flags & 0x04 != 0 {
        read_string(body)?;
        read_binary(body)?;
    }
    let username = if flags & 0x80 != 0 {
        Some(read_binary(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_binary(body)?)
    } else {
        None
    };

    Ok(Connect {
        protocol_level,
        client_id,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        username,
        password,
    })
}

fn parse_publish(flags: u8, body: &mut Bytes) -> Result<Publish, CodecError> {
    let qos = (flags >> 1) & 0x03;
    if qos == 3 {
        return Err(CodecError::Malformed("invalid QoS"));
    }
    let topic = read_binary(body)?;
    if std::str::from_utf8(&topic).is_err() {
        return Err(CodecError::InvalidUtf8);
    }
    let packet_id = if qos > 0 {
        Some(read_u16(body)?)
    } else {
        None
    };
    let payload = body.split_to(body.len());
    Ok(Publish {
        dup: flags & 0x08 != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload,
    })
}

fn read_u8(body: &mut Bytes) -> Result<u8, CodecError> {
    if body.remaining() < 1 {
        return Err(CodecError::Malformed("truncated packet"));
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> Result<u16, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::Malformed("truncated packet"));
    }
    Ok(body.get_u16())
}

fn read_binary(body: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = read_u16(body)? as usize;
    if body.remaining() < len {
        return Err(CodecError::Malformed("truncated packet"));
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes) -> Result<String, CodecError> {
    let raw = read_binary(body)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn put_binary(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_binary(buf, s.as_bytes());
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        MqttCodec::default().encode(packet, &mut buf).unwrap();
        buf
    }

    fn roundtrip(packet: Packet) -> Packet {
        let mut buf = encode(packet);
        let decoded = MqttCodec::default().decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn test_connect_with_username() {
        let connect = Packet::Connect(Connect::new("c1", Some("alice")));
        assert_eq!(roundtrip(connect.clone()), connect);
    }

    #[test]
    fn test_connect_without_username() {
        let Packet::Connect(connect) = roundtrip(Packet::Connect(Connect::new("c1", None))) else {
            panic!("expected CONNECT");
        };
        assert!(connect.username.is_none());
    }

    #[test]
    fn test_connect_rejects_unknown_protocol() {
        let mut body = BytesMut::new();
        put_string(&mut body, "HTTP");
        body.put_u8(4);
        body.put_u8(0x02);
        body.put_u16(60);
        put_string(&mut body, "c");
        let mut buf = BytesMut::new();
        buf.put_u8(0x10);
        put_remaining_length(&mut buf, body.len());
        buf.put_slice(&body);
        assert!(matches!(
            MqttCodec::default().decode(&mut buf),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_publish_qos1_keeps_packet_id() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: 1,
            retain: false,
            topic: Bytes::from_static(b"sensors/temp"),
            packet_id: Some(42),
            payload: Bytes::from_static(b"21.5"),
        });
        assert_eq!(roundtrip(publish.clone()), publish);
    }

    #[test]
    fn test_publish_multibyte_length() {
        let payload = vec![7u8; 300];
        let publish = Packet::Publish(Publish::qos0("t", payload));
        let buf = encode(publish.clone());
        // 2-byte remaining length: 2 (topic len) + 1 + 300 = 303.
        assert_eq!(&buf[1..3], &[0xAF, 0x02]);
        assert_eq!(roundtrip(publish.clone()), publish);
    }

    #[test]
    fn test_subscribe_and_suback() {
        let subscribe = Packet::Subscribe {
            packet_id: 7,
            filters: vec![("a".into(), 0), ("b/c".into(), 1)],
        };
        assert_eq!(roundtrip(subscribe.clone()), subscribe);
        let suback = Packet::SubAck {
            packet_id: 7,
            codes: vec![0x00, SUBACK_FAILURE],
        };
        assert_eq!(roundtrip(suback.clone()), suback);
    }

    #[test]
    fn test_control_packets() {
        for packet in [
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
            Packet::UnsubAck { packet_id: 3 },
            Packet::PubAck { packet_id: 4 },
            Packet::ConnAck {
                session_present: false,
                code: CONNACK_ACCEPTED,
            },
        ] {
            assert_eq!(roundtrip(packet.clone()), packet);
        }
    }

    #[test]
    fn test_partial_input_waits() {
        let full = encode(Packet::Publish(Publish::qos0("t", "payload")));
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[full.len() - 2..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_packets_in_one_buffer() {
        let mut buf = encode(Packet::PingReq);
        buf.extend_from_slice(&encode(Packet::Disconnect));
        let mut codec = MqttCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingReq));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::Disconnect));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_malformed_remaining_length() {
        let mut buf = BytesMut::from(&[0x30, 0xff, 0xff, 0xff, 0xff, 0x01][..]);
        assert!(matches!(
            MqttCodec::default().decode(&mut buf),
            Err(CodecError::MalformedLength)
        ));
    }

    #[test]
    fn test_packet_too_large() {
        let mut codec = MqttCodec::new(16);
        let mut buf = BytesMut::new();
        MqttCodec::default()
            .encode(Packet::Publish(Publish::qos0("t", vec![0u8; 64])), &mut buf)
            .unwrap();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn test_unsupported_packet_type() {
        // PUBREC
        let mut buf = BytesMut::from(&[0x50, 0x02, 0x00, 0x01][..]);
        assert!(matches!(
            MqttCodec::default().decode(&mut buf),
            Err(CodecError::UnsupportedPacket(5))
        ));
    }

    #[test]
    fn test_subscribe_bad_flags() {
        let mut buf = encode(Packet::Subscribe {
            packet_id: 1,
            filters: vec![("a".into(), 0)],
        });
        buf[0] = 0x80;
        assert!(matches!(
            MqttCodec::default().decode(&mut buf),
            Err(CodecError::Malformed(_))
        ));
    }
}
