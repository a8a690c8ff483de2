//! MQTT 3.1.1 control packets and their wire encoding
//!
//! Every packet the client sends or receives is represented by [`Packet`].
//! Encoding writes a complete frame (fixed header, variable header and
//! payload) into a `BytesMut`; decoding consumes exactly one frame from the
//! front of a read buffer, returning `Ok(None)` while the frame is incomplete.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol name carried in CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level for MQTT 3.1.1
pub const PROTOCOL_LEVEL: u8 = 4;
/// Largest value the variable length "remaining length" field can hold
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;
/// SUBACK return code signalling a rejected subscription
pub const SUBACK_FAILURE: u8 = 0x80;

/// Wire-level protocol violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
    #[error("Invalid CONNACK return code: {0}")]
    InvalidReturnCode(u8),
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("String field is not valid UTF-8")]
    InvalidUtf8,
    #[error("Packet of {size} bytes exceeds maximum of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedPacket(message.into())
    }
}

/// Quality of service level
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce = 0,
    /// Acknowledged with PUBACK, may be delivered more than once
    AtLeastOnce = 1,
    /// Four-step PUBLISH/PUBREC/PUBREL/PUBCOMP handshake
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::InvalidQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// CONNACK return codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// Credential rejections are never retried
    pub fn is_auth_failure(self) -> bool {
        matches!(
            self,
            ConnectReturnCode::BadUsernamePassword | ConnectReturnCode::NotAuthorized
        )
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUsernamePassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            other => Err(ProtocolError::InvalidReturnCode(other)),
        }
    }
}

impl std::fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectReturnCode::Accepted => "accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnectReturnCode::IdentifierRejected => "client identifier rejected",
            ConnectReturnCode::ServerUnavailable => "server unavailable",
            ConnectReturnCode::BadUsernamePassword => "bad user name or password",
            ConnectReturnCode::NotAuthorized => "not authorized",
        };
        f.write_str(text)
    }
}

/// CONNECT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

/// CONNACK packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present if and only if `qos` is above zero
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    /// Build a QoS 0 publish
    pub fn at_most_once(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    /// Build a QoS 1 or QoS 2 publish carrying a packet identifier
    pub fn with_id(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        packet_id: u16,
    ) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: Some(packet_id),
            payload: payload.into(),
        }
    }
}

/// SUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Granted QoS per filter, or [`SUBACK_FAILURE`]
    pub return_codes: Vec<u8>,
}

impl SubAck {
    pub fn has_failures(&self) -> bool {
        self.return_codes.iter().any(|&code| code == SUBACK_FAILURE)
    }
}

/// UNSUBSCRIBE packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// MQTT 3.1.1 control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Short packet name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Append the encoded frame to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Packet::Connect(connect) => encode_connect(connect, buf),
            Packet::ConnAck(connack) => {
                let body = [u8::from(connack.session_present), connack.code as u8];
                write_frame(buf, 0x20, &body)
            }
            Packet::Publish(publish) => encode_publish(publish, buf),
            Packet::PubAck(id) => write_frame(buf, 0x40, &id.to_be_bytes()),
            Packet::PubRec(id) => write_frame(buf, 0x50, &id.to_be_bytes()),
            Packet::PubRel(id) => write_frame(buf, 0x62, &id.to_be_bytes()),
            Packet::PubComp(id) => write_frame(buf, 0x70, &id.to_be_bytes()),
            Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
            Packet::SubAck(suback) => {
                let mut body = BytesMut::with_capacity(2 + suback.return_codes.len());
                body.put_u16(suback.packet_id);
                body.put_slice(&suback.return_codes);
                write_frame(buf, 0x90, &body)
            }
            Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
            Packet::UnsubAck(id) => write_frame(buf, 0xB0, &id.to_be_bytes()),
            Packet::PingReq => write_frame(buf, 0xC0, &[]),
            Packet::PingResp => write_frame(buf, 0xD0, &[]),
            Packet::Disconnect => write_frame(buf, 0xE0, &[]),
        }
    }

    /// Take one complete frame off the front of `buf`
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when more bytes are needed.
    pub fn decode(buf: &mut BytesMut, max_packet_size: usize) -> Result<Option<Packet>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let (remaining, length_bytes) = match decode_remaining_length(&buf[1..])? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        let frame_len = 1 + length_bytes + remaining;
        if frame_len > max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                size: frame_len,
                max: max_packet_size,
            });
        }
        if buf.len() < frame_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len).freeze();
        let header = frame.get_u8();
        frame.advance(length_bytes);

        decode_body(header, frame).map(Some)
    }
}

/// Parse the variable length "remaining length" field
///
/// Returns `(value, bytes_consumed)` or `None` when the field is incomplete.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (index, &byte) in buf.iter().enumerate() {
        if index == 4 {
            return Err(ProtocolError::InvalidRemainingLength);
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(ProtocolError::InvalidRemainingLength);
    }
    Ok(None)
}

fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) {
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

fn write_frame(buf: &mut BytesMut, header: u8, body: &[u8]) -> Result<(), ProtocolError> {
    if body.len() > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge {
            size: body.len(),
            max: MAX_REMAINING_LENGTH,
        });
    }
    buf.reserve(body.len() + 5);
    buf.put_u8(header);
    encode_remaining_length(body.len(), buf);
    buf.put_slice(body);
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    put_binary(buf, value.as_bytes())
}

fn put_binary(buf: &mut BytesMut, value: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len())
        .map_err(|_| ProtocolError::malformed(format!("field of {} bytes is too long", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn encode_connect(connect: &Connect, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if connect.password.is_some() && connect.username.is_none() {
        return Err(ProtocolError::malformed("password set without a user name"));
    }

    let mut flags = 0u8;
    if connect.username.is_some() {
        flags |= 0x80;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.clean_session {
        flags |= 0x02;
    }

    let mut body = BytesMut::new();
    put_string(&mut body, PROTOCOL_NAME)?;
    body.put_u8(PROTOCOL_LEVEL);
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    put_string(&mut body, &connect.client_id)?;
    if let Some(username) = &connect.username {
        put_string(&mut body, username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(&mut body, password)?;
    }

    write_frame(buf, 0x10, &body)
}

fn encode_publish(publish: &Publish, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut header = 0x30 | ((publish.qos as u8) << 1);
    if publish.dup {
        header |= 0x08;
    }
    if publish.retain {
        header |= 0x01;
    }

    let mut body = BytesMut::with_capacity(publish.topic.len() + publish.payload.len() + 4);
    put_string(&mut body, &publish.topic)?;
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => {}
        (_, Some(0)) | (_, None) => {
            return Err(ProtocolError::malformed(
                "QoS 1 and 2 publishes need a non-zero packet identifier",
            ))
        }
        (_, Some(id)) => body.put_u16(id),
    }
    body.put_slice(&publish.payload);

    write_frame(buf, header, &body)
}

fn encode_subscribe(subscribe: &Subscribe, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if subscribe.filters.is_empty() {
        return Err(ProtocolError::malformed("SUBSCRIBE needs at least one filter"));
    }

    let mut body = BytesMut::new();
    body.put_u16(subscribe.packet_id);
    for (filter, qos) in &subscribe.filters {
        put_string(&mut body, filter)?;
        body.put_u8(*qos as u8);
    }

    write_frame(buf, 0x82, &body)
}

fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if unsubscribe.filters.is_empty() {
        return Err(ProtocolError::malformed("UNSUBSCRIBE needs at least one filter"));
    }

    let mut body = BytesMut::new();
    body.put_u16(unsubscribe.packet_id);
    for filter in &unsubscribe.filters {
        put_string(&mut body, filter)?;
    }

    write_frame(buf, 0xA2, &body)
}

fn read_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::malformed("unexpected end of packet"));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::malformed("unexpected end of packet"));
    }
    Ok(buf.get_u16())
}

fn read_packet_id(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    match read_u16(buf)? {
        0 => Err(ProtocolError::malformed("packet identifier must be non-zero")),
        id => Ok(id),
    }
}

fn read_binary(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let len = read_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::malformed("length prefix runs past end of packet"));
    }
    Ok(buf.split_to(len))
}

fn read_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = read_binary(buf)?;
    let text = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    if text.contains('\0') {
        return Err(ProtocolError::malformed("string contains a null character"));
    }
    Ok(text.to_string())
}

fn expect_flags(header: u8, expected: u8) -> Result<(), ProtocolError> {
    if header & 0x0F != expected {
        return Err(ProtocolError::malformed(format!(
            "reserved flags {:#06b} on packet type {}",
            header & 0x0F,
            header >> 4
        )));
    }
    Ok(())
}

fn expect_empty(body: &Bytes) -> Result<(), ProtocolError> {
    if body.has_remaining() {
        return Err(ProtocolError::malformed("trailing bytes after packet"));
    }
    Ok(())
}

fn decode_ack(header: u8, expected_flags: u8, mut body: Bytes) -> Result<u16, ProtocolError> {
    expect_flags(header, expected_flags)?;
    let id = read_packet_id(&mut body)?;
    expect_empty(&body)?;
    Ok(id)
}

fn decode_body(header: u8, mut body: Bytes) -> Result<Packet, ProtocolError> {
    match header >> 4 {
        1 => {
            expect_flags(header, 0)?;
            decode_connect(body).map(Packet::Connect)
        }
        2 => {
            expect_flags(header, 0)?;
            let flags = read_u8(&mut body)?;
            if flags & 0xFE != 0 {
                return Err(ProtocolError::malformed("reserved CONNACK flags set"));
            }
            let code = ConnectReturnCode::try_from(read_u8(&mut body)?)?;
            expect_empty(&body)?;
            Ok(Packet::ConnAck(ConnAck {
                session_present: flags & 0x01 == 1,
                code,
            }))
        }
        3 => decode_publish(header, body).map(Packet::Publish),
        4 => decode_ack(header, 0, body).map(Packet::PubAck),
        5 => decode_ack(header, 0, body).map(Packet::PubRec),
        6 => decode_ack(header, 0x02, body).map(Packet::PubRel),
        7 => decode_ack(header, 0, body).map(Packet::PubComp),
        8 => {
            expect_flags(header, 0x02)?;
            let packet_id = read_packet_id(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                let filter = read_string(&mut body)?;
                let qos = QoS::try_from(read_u8(&mut body)?)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(ProtocolError::malformed("SUBSCRIBE without filters"));
            }
            Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
        }
        9 => {
            expect_flags(header, 0)?;
            let packet_id = read_packet_id(&mut body)?;
            let return_codes = body.to_vec();
            if let Some(code) = return_codes
                .iter()
                .find(|&&code| code > 2 && code != SUBACK_FAILURE)
            {
                return Err(ProtocolError::malformed(format!(
                    "invalid SUBACK return code {code:#04x}"
                )));
            }
            Ok(Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            }))
        }
        10 => {
            expect_flags(header, 0x02)?;
            let packet_id = read_packet_id(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(read_string(&mut body)?);
            }
            if filters.is_empty() {
                return Err(ProtocolError::malformed("UNSUBSCRIBE without filters"));
            }
            Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
        }
        11 => decode_ack(header, 0, body).map(Packet::UnsubAck),
        12 => {
            expect_flags(header, 0)?;
            expect_empty(&body)?;
            Ok(Packet::PingReq)
        }
        13 => {
            expect_flags(header, 0)?;
            expect_empty(&body)?;
            Ok(Packet::PingResp)
        }
        14 => {
            expect_flags(header, 0)?;
            expect_empty(&body)?;
            Ok(Packet::Disconnect)
        }
        other => Err(ProtocolError::InvalidPacketType(other)),
    }
}

fn decode_connect(mut body: Bytes) -> Result<Connect, ProtocolError> {
    let protocol_name = read_string(&mut body)?;
    if protocol_name != PROTOCOL_NAME {
        return Err(ProtocolError::malformed(format!(
            "unsupported protocol name {protocol_name:?}"
        )));
    }
    let level = read_u8(&mut body)?;
    if level != PROTOCOL_LEVEL {
        return Err(ProtocolError::malformed(format!(
            "unsupported protocol level {level}"
        )));
    }

    let flags = read_u8(&mut body)?;
    if flags & 0x01 != 0 {
        return Err(ProtocolError::malformed("reserved CONNECT flag set"));
    }
    if flags & 0x04 != 0 {
        return Err(ProtocolError::malformed("will messages are not supported"));
    }
    let keep_alive = read_u16(&mut body)?;
    let client_id = read_string(&mut body)?;
    let username = if flags & 0x80 != 0 {
        Some(read_string(&mut body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_binary(&mut body)?.to_vec())
    } else {
        None
    };
    expect_empty(&body)?;

    Ok(Connect {
        client_id,
        keep_alive,
        clean_session: flags & 0x02 != 0,
        username,
        password,
    })
}

fn decode_publish(header: u8, mut body: Bytes) -> Result<Publish, ProtocolError> {
    let qos = QoS::try_from((header >> 1) & 0x03)?;
    let dup = header & 0x08 != 0;
    if qos == QoS::AtMostOnce && dup {
        return Err(ProtocolError::malformed("DUP flag set on a QoS 0 publish"));
    }

    let topic = read_string(&mut body)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(read_packet_id(&mut body)?),
    };

    Ok(Publish {
        dup,
        qos,
        retain: header & 0x01 != 0,
        topic,
        packet_id,
        payload: body,
    })
}
