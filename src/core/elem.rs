//! Queued elements and their byte encoding.
//!
//! Stored elements are matched byte-for-byte when they are removed or replaced,
//! so `encode` is deterministic and `decode(encode(e)) == e` for every element.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::message::{current_timestamp, Message, PacketId, QoSLevel};

const FORMAT_VERSION: u8 = 1;

const KIND_PUBLISH: u8 = 0;
const KIND_PUBREL: u8 = 1;

const ELEM_HAS_EXPIRY: u8 = 0b0000_0001;

const MSG_RETAINED: u8 = 0b0000_0001;
const MSG_DUP: u8 = 0b0000_0010;
const MSG_CONTENT_TYPE: u8 = 0b0000_0100;
const MSG_RESPONSE_TOPIC: u8 = 0b0000_1000;
const MSG_CORRELATION_DATA: u8 = 0b0001_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("element truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported element format version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown element kind {0}")]
    UnknownKind(u8),

    #[error("invalid QoS value {0}")]
    InvalidQos(u8),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("{0} trailing bytes after element")]
    TrailingBytes(usize),

    #[error("{0} too large to encode")]
    TooLarge(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub packet_id: PacketId,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pubrel {
    pub packet_id: PacketId,
}

/// Delivery class of a queued element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageWithId {
    Publish(Publish),
    /// Release of an exactly-once publish the client already received.
    Pubrel(Pubrel),
}

impl MessageWithId {
    pub fn packet_id(&self) -> PacketId {
        match self {
            MessageWithId::Publish(p) => p.packet_id,
            MessageWithId::Pubrel(p) => p.packet_id,
        }
    }

    pub fn set_packet_id(&mut self, id: PacketId) {
        match self {
            MessageWithId::Publish(p) => p.packet_id = id,
            MessageWithId::Pubrel(p) => p.packet_id = id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elem {
    /// Enqueue time, unix milliseconds.
    pub at: u64,
    /// Expiry, unix milliseconds.
    pub expiry: Option<u64>,
    pub message: MessageWithId,
}

impl Elem {
    /// A not-yet-dispatched publish, stamped with the current time.
    pub fn publish(message: Message) -> Self {
        Self {
            at: current_timestamp(),
            expiry: None,
            message: MessageWithId::Publish(Publish {
                packet_id: PacketId::UNASSIGNED,
                message,
            }),
        }
    }

    pub fn pubrel(packet_id: PacketId) -> Self {
        Self {
            at: current_timestamp(),
            expiry: None,
            message: MessageWithId::Pubrel(Pubrel { packet_id }),
        }
    }

    pub fn with_expiry(mut self, expiry_ms: u64) -> Self {
        self.expiry = Some(expiry_ms);
        self
    }

    pub fn expires_in(self, ttl: Duration) -> Self {
        let expiry = self.at.saturating_add(ttl.as_millis() as u64);
        self.with_expiry(expiry)
    }

    pub fn packet_id(&self) -> PacketId {
        self.message.packet_id()
    }

    pub fn set_packet_id(&mut self, id: PacketId) {
        self.message.set_packet_id(id);
    }

    /// The routed message, if this element is a publish.
    pub fn as_message(&self) -> Option<&Message> {
        match &self.message {
            MessageWithId::Publish(p) => Some(&p.message),
            MessageWithId::Pubrel(_) => None,
        }
    }

    /// True for fire-and-forget publishes.
    pub fn is_at_most_once(&self) -> bool {
        matches!(&self.message, MessageWithId::Publish(p) if p.message.qos == QoSLevel::AtMostOnce)
    }

    /// Only publishes expire; a pending release must always reach the client.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match (&self.message, self.expiry) {
            (MessageWithId::Publish(_), Some(expiry)) => now_ms > expiry,
            _ => false,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(FORMAT_VERSION);

        let kind = match self.message {
            MessageWithId::Publish(_) => KIND_PUBLISH,
            MessageWithId::Pubrel(_) => KIND_PUBREL,
        };
        buf.put_u8(kind);

        let flags = if self.expiry.is_some() {
            ELEM_HAS_EXPIRY
        } else {
            0
        };
        buf.put_u8(flags);
        buf.put_u64(self.at);
        if let Some(expiry) = self.expiry {
            buf.put_u64(expiry);
        }
        buf.put_u16(self.packet_id().value());

        if let MessageWithId::Publish(publish) = &self.message {
            encode_message(&publish.message, &mut buf)?;
        }

        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut slice = bytes;

        let version = take_u8(&mut slice, "format version")?;
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let kind = take_u8(&mut slice, "element kind")?;
        let flags = take_u8(&mut slice, "element flags")?;
        let at = take_u64(&mut slice, "enqueue time")?;
        let expiry = if flags & ELEM_HAS_EXPIRY != 0 {
            Some(take_u64(&mut slice, "expiry")?)
        } else {
            None
        };
        let packet_id = PacketId::new(take_u16(&mut slice, "packet id")?);

        let message = match kind {
            KIND_PUBLISH => MessageWithId::Publish(Publish {
                packet_id,
                message: decode_message(&mut slice)?,
            }),
            KIND_PUBREL => MessageWithId::Pubrel(Pubrel { packet_id }),
            other => return Err(CodecError::UnknownKind(other)),
        };

        if slice.has_remaining() {
            return Err(CodecError::TrailingBytes(slice.remaining()));
        }

        Ok(Self {
            at,
            expiry,
            message,
        })
    }
}

fn encode_message(msg: &Message, buf: &mut BytesMut) -> Result<(), CodecError> {
    buf.put_u8(msg.qos.as_u8());

    let mut flags = 0u8;
    if msg.retained {
        flags |= MSG_RETAINED;
    }
    if msg.dup {
        flags |= MSG_DUP;
    }
    if msg.content_type.is_some() {
        flags |= MSG_CONTENT_TYPE;
    }
    if msg.response_topic.is_some() {
        flags |= MSG_RESPONSE_TOPIC;
    }
    if msg.correlation_data.is_some() {
        flags |= MSG_CORRELATION_DATA;
    }
    buf.put_u8(flags);

    put_str(buf, &msg.topic, "topic")?;
    if let Some(content_type) = &msg.content_type {
        put_str(buf, content_type, "content type")?;
    }
    if let Some(response_topic) = &msg.response_topic {
        put_str(buf, response_topic, "response topic")?;
    }
    if let Some(correlation) = &msg.correlation_data {
        put_blob(buf, correlation, "correlation data")?;
    }

    let props = u16::try_from(msg.user_properties.len())
        .map_err(|_| CodecError::TooLarge("user properties"))?;
    buf.put_u16(props);
    for (key, value) in &msg.user_properties {
        put_str(buf, key, "user property key")?;
        put_str(buf, value, "user property value")?;
    }

    put_blob(buf, &msg.payload, "payload")
}

fn decode_message(slice: &mut &[u8]) -> Result<Message, CodecError> {
    let qos_byte = take_u8(slice, "qos")?;
    let qos = QoSLevel::from_u8(qos_byte).ok_or(CodecError::InvalidQos(qos_byte))?;
    let flags = take_u8(slice, "message flags")?;

    let topic = take_str(slice, "topic")?;
    let content_type = if flags & MSG_CONTENT_TYPE != 0 {
        Some(take_str(slice, "content type")?)
    } else {
        None
    };
    let response_topic = if flags & MSG_RESPONSE_TOPIC != 0 {
        Some(take_str(slice, "response topic")?)
    } else {
        None
    };
    let correlation_data = if flags & MSG_CORRELATION_DATA != 0 {
        Some(take_blob(slice, "correlation data")?)
    } else {
        None
    };

    let props = take_u16(slice, "user property count")? as usize;
    let mut user_properties = Vec::with_capacity(props.min(64));
    for _ in 0..props {
        let key = take_str(slice, "user property key")?;
        let value = take_str(slice, "user property value")?;
        user_properties.push((key, value));
    }

    let payload = take_blob(slice, "payload")?;

    Ok(Message {
        topic,
        payload,
        qos,
        retained: flags & MSG_RETAINED != 0,
        dup: flags & MSG_DUP != 0,
        content_type,
        response_topic,
        correlation_data,
        user_properties,
    })
}

fn put_str(buf: &mut BytesMut, value: &str, field: &'static str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::TooLarge(field))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_blob(buf: &mut BytesMut, value: &[u8], field: &'static str) -> Result<(), CodecError> {
    let len = u32::try_from(value.len()).map_err(|_| CodecError::TooLarge(field))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

fn take_u8(slice: &mut &[u8], field: &'static str) -> Result<u8, CodecError> {
    if slice.remaining() < 1 {
        return Err(CodecError::Truncated(field));
    }
    Ok(slice.get_u8())
}

fn take_u16(slice: &mut &[u8], field: &'static str) -> Result<u16, CodecError> {
    if slice.remaining() < 2 {
        return Err(CodecError::Truncated(field));
    }
    Ok(slice.get_u16())
}

fn take_u64(slice: &mut &[u8], field: &'static str) -> Result<u64, CodecError> {
    if slice.remaining() < 8 {
        return Err(CodecError::Truncated(field));
    }
    Ok(slice.get_u64())
}

fn take_str(slice: &mut &[u8], field: &'static str) -> Result<String, CodecError> {
    let len = take_u16(slice, field)? as usize;
    if slice.remaining() < len {
        return Err(CodecError::Truncated(field));
    }
    let raw = slice.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))
}

fn take_blob(slice: &mut &[u8], field: &'static str) -> Result<Bytes, CodecError> {
    if slice.remaining() < 4 {
        return Err(CodecError::Truncated(field));
    }
    let len = slice.get_u32() as usize;
    if slice.remaining() < len {
        return Err(CodecError::Truncated(field));
    }
    Ok(slice.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_message() -> Message {
        let mut msg = Message::new("sensors/kitchen", "21.5", QoSLevel::ExactlyOnce);
        msg.retained = true;
        msg.dup = true;
        msg.content_type = Some("text/plain".to_string());
        msg.response_topic = Some("replies/kitchen".to_string());
        msg.correlation_data = Some(Bytes::from_static(b"\x00\x01\x02"));
        msg.user_properties = vec![
            ("unit".to_string(), "celsius".to_string()),
            ("unit".to_string(), "duplicate-keys-kept".to_string()),
        ];
        msg
    }

    #[test]
    fn publish_roundtrip_preserves_every_field() {
        let mut elem = Elem::publish(full_message()).with_expiry(1_700_000_000_123);
        elem.set_packet_id(PacketId::new(42));

        let encoded = elem.encode().unwrap();
        let decoded = Elem::decode(&encoded).unwrap();

        assert_eq!(decoded, elem);
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn pubrel_roundtrip() {
        let elem = Elem::pubrel(PacketId::new(7));
        let decoded = Elem::decode(&elem.encode().unwrap()).unwrap();
        assert_eq!(decoded, elem);
        assert!(decoded.as_message().is_none());
    }

    #[test]
    fn expiry_zero_is_distinct_from_no_expiry() {
        let msg = Message::new("t", "p", QoSLevel::AtLeastOnce);
        let a = Elem::publish(msg.clone());
        let mut b = a.clone();
        b.expiry = Some(0);

        assert_ne!(a.encode().unwrap(), b.encode().unwrap());
        assert_eq!(Elem::decode(&b.encode().unwrap()).unwrap().expiry, Some(0));
    }

    #[test]
    fn packet_id_changes_encoding() {
        let mut elem = Elem::publish(Message::new("t", "p", QoSLevel::AtLeastOnce));
        let before = elem.encode().unwrap();
        elem.set_packet_id(PacketId::new(1));
        assert_ne!(before, elem.encode().unwrap());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let elem = Elem::publish(full_message());
        let encoded = elem.encode().unwrap();
        for cut in 0..encoded.len() {
            let err = Elem::decode(&encoded[..cut]).unwrap_err();
            assert!(matches!(err, CodecError::Truncated(_)), "cut {cut}: {err:?}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let elem = Elem::pubrel(PacketId::new(3));
        let mut raw = elem.encode().unwrap().to_vec();
        raw.push(0xAA);
        assert_eq!(Elem::decode(&raw), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn bad_headers_are_rejected() {
        let mut raw = Elem::pubrel(PacketId::new(3)).encode().unwrap().to_vec();
        raw[0] = 9;
        assert_eq!(Elem::decode(&raw), Err(CodecError::UnsupportedVersion(9)));

        raw[0] = FORMAT_VERSION;
        raw[1] = 7;
        assert_eq!(Elem::decode(&raw), Err(CodecError::UnknownKind(7)));
    }

    #[test]
    fn invalid_qos_is_rejected() {
        let elem = Elem::publish(Message::new("t", "p", QoSLevel::AtMostOnce));
        let mut raw = elem.encode().unwrap().to_vec();
        // version, kind, flags, at(8), packet id(2), then qos.
        raw[13] = 5;
        assert_eq!(Elem::decode(&raw), Err(CodecError::InvalidQos(5)));
    }

    #[test]
    fn expiry_only_applies_to_publishes() {
        let publish = Elem::publish(Message::new("t", "p", QoSLevel::AtLeastOnce)).with_expiry(100);
        assert!(!publish.is_expired(100));
        assert!(publish.is_expired(101));

        let pubrel = Elem::pubrel(PacketId::new(1)).with_expiry(100);
        assert!(!pubrel.is_expired(u64::MAX));
    }

    #[test]
    fn at_most_once_classification() {
        let qos0 = Elem::publish(Message::new("t", "p", QoSLevel::AtMostOnce));
        let qos2 = Elem::publish(Message::new("t", "p", QoSLevel::ExactlyOnce));
        assert!(qos0.is_at_most_once());
        assert!(!qos2.is_at_most_once());
        assert!(!Elem::pubrel(PacketId::new(1)).is_at_most_once());
    }
}
