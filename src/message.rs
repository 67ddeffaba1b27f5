use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::destination::Destination;
use crate::error::{Result, StompError};
use crate::ids::{MessageId, TransactionId};

/// Default JMS priority.
pub const DEFAULT_PRIORITY: u8 = 4;

/// Body of a message.
///
/// Map and stream bodies are carried as opaque bytes; their encoding belongs
/// to the application. The variant decides which `transformation` marker is
/// written on the wire so a peer client can pick the right decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Map(Vec<u8>),
    Stream(Vec<u8>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(s) => s.as_bytes(),
            Payload::Bytes(b) | Payload::Map(b) | Payload::Stream(b) => b,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(s) => s.into_bytes(),
            Payload::Bytes(b) | Payload::Map(b) | Payload::Stream(b) => b,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

/// Milliseconds since the Unix epoch, the broker's time convention.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A message sent by a producer or delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: Option<MessageId>,
    pub destination: Option<Destination>,
    pub reply_to: Option<Destination>,
    pub correlation_id: Option<String>,
    pub transaction_id: Option<TransactionId>,
    /// Send time, ms since the epoch. 0 when not stamped.
    pub timestamp: i64,
    /// Absolute expiry, ms since the epoch. 0 means never.
    pub expiration: i64,
    pub priority: u8,
    pub persistent: bool,
    pub redelivery_counter: u32,
    pub message_type: Option<String>,
    pub group_id: Option<String>,
    pub group_sequence: i32,
    properties: Vec<(String, String)>,
    payload: Payload,
    read_only: bool,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            message_id: None,
            destination: None,
            reply_to: None,
            correlation_id: None,
            transaction_id: None,
            timestamp: 0,
            expiration: 0,
            priority: DEFAULT_PRIORITY,
            persistent: true,
            redelivery_counter: 0,
            message_type: None,
            group_id: None,
            group_sequence: 0,
            properties: Vec::new(),
            payload: Payload::default(),
            read_only: false,
        }
    }
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(Payload::Text(body.into()))
    }

    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self::new(Payload::Bytes(body.into()))
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Text body, or `MessageFormat` when the payload is not text.
    pub fn body_text(&self) -> Result<&str> {
        match &self.payload {
            Payload::Text(s) => Ok(s),
            other => Err(StompError::MessageFormat(format!(
                "expected a text body, found {}",
                payload_name(other)
            ))),
        }
    }

    pub fn set_payload(&mut self, payload: Payload) -> Result<()> {
        self.check_writable()?;
        self.payload = payload;
        Ok(())
    }

    /// User properties in insertion order.
    pub fn properties(&self) -> &[(String, String)] {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.check_writable()?;
        let key = key.into();
        let value = value.into();
        match self.properties.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.properties.push((key, value)),
        }
        Ok(())
    }

    /// Builder form of [`Message::set_property`] for outgoing messages.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        self.properties.retain(|(k, _)| *k != key);
        self.properties.push((key, value));
        self
    }

    pub(crate) fn push_property(&mut self, key: String, value: String) {
        self.properties.push((key, value));
    }

    pub fn clear_properties(&mut self) {
        self.properties.clear();
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivery_counter > 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expiration != 0 && now_ms > self.expiration
    }

    pub(crate) fn set_time_to_live(&mut self, ttl: Option<Duration>, now_ms: i64) {
        self.expiration = match ttl {
            Some(ttl) if !ttl.is_zero() => now_ms + ttl.as_millis() as i64,
            _ => 0,
        };
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StompError::MessageFormat("message is read-only".into()));
        }
        Ok(())
    }
}

fn payload_name(p: &Payload) -> &'static str {
    match p {
        Payload::Text(_) => "text",
        Payload::Bytes(_) => "bytes",
        Payload::Map(_) => "map",
        Payload::Stream(_) => "stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_zero_never_expires() {
        let m = Message::text("x");
        assert!(!m.is_expired_at(i64::MAX));
    }

    #[test]
    fn expiration_is_strictly_after() {
        let mut m = Message::text("x");
        m.expiration = 1_000;
        assert!(!m.is_expired_at(1_000));
        assert!(m.is_expired_at(1_001));
    }

    #[test]
    fn read_only_rejects_mutation() {
        let mut m = Message::text("x");
        m.set_read_only(true);
        assert!(m.set_property("a", "b").is_err());
        assert!(m.set_payload(Payload::Bytes(vec![1])).is_err());
        m.set_read_only(false);
        m.set_property("a", "b").unwrap();
        assert_eq!(m.property("a"), Some("b"));
    }

    #[test]
    fn body_text_on_bytes_is_format_error() {
        let m = Message::bytes(vec![0u8, 1]);
        assert!(matches!(m.body_text(), Err(StompError::MessageFormat(_))));
    }
}
