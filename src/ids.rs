//! Hierarchical identifiers: connection → session → consumer/producer →
//! message, plus transaction ids.
//!
//! Every level renders as the parent's string form followed by `:ordinal`, so
//! `ID:host-4242-1700000000000-1:3:7:12` is message 12 of producer 7 in
//! session 3 of connection `ID:host-4242-1700000000000-1`. Parsing works from
//! the right, which lets connection ids contain `:` themselves.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StompError;

/// Monotonic per-parent ordinal counter. The first value handed out is 1.
#[derive(Debug, Default)]
pub struct LongSequenceGenerator {
    last: AtomicI64,
}

impl LongSequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_sequence(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_sequence(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

/// Produces process-unique connection ids of the form `ID:<seed>-<n>`.
#[derive(Debug)]
pub struct IdGenerator {
    seed: String,
    sequence: AtomicU64,
}

impl IdGenerator {
    pub fn new(prefix: &str) -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Self {
            seed: format!("{}{}-{}-", prefix, std::process::id(), started),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn generate_id(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{}", self.seed, n)
    }
}

/// Shared generator for connection ids.
pub(crate) fn connection_id_generator() -> &'static IdGenerator {
    static GENERATOR: std::sync::OnceLock<IdGenerator> = std::sync::OnceLock::new();
    GENERATOR.get_or_init(|| IdGenerator::new("ID:osmium-"))
}

/// Shared generator for client ids when none is configured.
pub(crate) fn client_id_generator() -> &'static IdGenerator {
    static GENERATOR: std::sync::OnceLock<IdGenerator> = std::sync::OnceLock::new();
    GENERATOR.get_or_init(|| IdGenerator::new("osmium-client-"))
}

fn parse_ordinal(part: Option<&str>, what: &str, input: &str) -> Result<i64, StompError> {
    part.and_then(|p| p.parse::<i64>().ok())
        .ok_or_else(|| StompError::MessageFormat(format!("invalid {} in id '{}'", what, input)))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    value: String,
}

impl ConnectionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn generate() -> Self {
        Self::new(connection_id_generator().generate_id())
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    connection_id: String,
    value: i64,
}

impl SessionId {
    pub fn new(connection_id: &ConnectionId, value: i64) -> Self {
        Self {
            connection_id: connection_id.value.clone(),
            value,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.connection_id.clone())
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.value)
    }
}

macro_rules! session_child_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name {
            connection_id: String,
            session_id: i64,
            value: i64,
        }

        impl $name {
            pub fn new(session_id: &SessionId, value: i64) -> Self {
                Self {
                    connection_id: session_id.connection_id.clone(),
                    session_id: session_id.value,
                    value,
                }
            }

            pub fn connection_id(&self) -> ConnectionId {
                ConnectionId::new(self.connection_id.clone())
            }

            pub fn session_id(&self) -> SessionId {
                SessionId {
                    connection_id: self.connection_id.clone(),
                    value: self.session_id,
                }
            }

            pub fn value(&self) -> i64 {
                self.value
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
            }
        }

        impl FromStr for $name {
            type Err = StompError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut parts = s.rsplitn(3, ':');
                let value = parse_ordinal(parts.next(), "ordinal", s)?;
                let session_id = parse_ordinal(parts.next(), "session ordinal", s)?;
                let connection_id = parts
                    .next()
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        StompError::MessageFormat(format!("missing connection id in '{}'", s))
                    })?;
                Ok(Self {
                    connection_id: connection_id.to_string(),
                    session_id,
                    value,
                })
            }
        }
    };
}

session_child_id!(ConsumerId);
session_child_id!(ProducerId);

/// Identity of one message: the producer that sent it plus the producer's
/// sequence number. Messages whose `message-id` does not follow that layout
/// (other clients, other brokers) keep their original text so they can still
/// be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    producer_id: Option<ProducerId>,
    producer_sequence_id: i64,
    broker_sequence_id: i64,
    text: Option<String>,
}

impl MessageId {
    pub fn new(producer_id: &ProducerId, producer_sequence_id: i64) -> Self {
        Self {
            producer_id: Some(producer_id.clone()),
            producer_sequence_id,
            broker_sequence_id: 0,
            text: None,
        }
    }

    /// Interpret a broker-supplied `message-id` header. Never fails: ids that
    /// cannot be decomposed are kept opaque.
    pub fn parse(text: &str) -> Self {
        if let Some((producer, seq)) = text.rsplit_once(':') {
            if let (Ok(producer_id), Ok(seq)) = (producer.parse::<ProducerId>(), seq.parse::<i64>())
            {
                let id = Self::new(&producer_id, seq);
                if id.to_string() == text {
                    return id;
                }
            }
        }
        Self {
            producer_id: None,
            producer_sequence_id: 0,
            broker_sequence_id: 0,
            text: Some(text.to_string()),
        }
    }

    pub fn producer_id(&self) -> Option<&ProducerId> {
        self.producer_id.as_ref()
    }

    pub fn producer_sequence_id(&self) -> i64 {
        self.producer_sequence_id
    }

    pub fn broker_sequence_id(&self) -> i64 {
        self.broker_sequence_id
    }

    pub fn set_broker_sequence_id(&mut self, value: i64) {
        self.broker_sequence_id = value;
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.text, &self.producer_id) {
            (Some(text), _) => f.write_str(text),
            (None, Some(p)) => write!(f, "{}:{}", p, self.producer_sequence_id),
            (None, None) => write!(f, "{}", self.producer_sequence_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId {
    connection_id: String,
    value: i64,
}

impl TransactionId {
    pub fn new(connection_id: &ConnectionId, value: i64) -> Self {
        Self {
            connection_id: connection_id.value.clone(),
            value,
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}:{}", self.connection_id, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::new(&ConnectionId::new("ID:host-1234-1:1"), 3)
    }

    #[test]
    fn string_forms_nest() {
        let s = session();
        let c = ConsumerId::new(&s, 7);
        let p = ProducerId::new(&s, 2);
        assert_eq!(s.to_string(), "ID:host-1234-1:1:3");
        assert_eq!(c.to_string(), "ID:host-1234-1:1:3:7");
        assert_eq!(MessageId::new(&p, 9).to_string(), "ID:host-1234-1:1:3:2:9");
    }

    #[test]
    fn consumer_id_parses_from_the_right() {
        let c = ConsumerId::new(&session(), 11);
        let parsed: ConsumerId = c.to_string().parse().unwrap();
        assert_eq!(parsed, c);
        assert_eq!(parsed.session_id(), session());
        assert!("nope".parse::<ConsumerId>().is_err());
        assert!(":1:2".parse::<ConsumerId>().is_err());
    }

    #[test]
    fn message_id_structural_equality() {
        let p = ProducerId::new(&session(), 1);
        let a = MessageId::new(&p, 5);
        let b = MessageId::parse("ID:host-1234-1:1:3:1:5");
        assert_eq!(a, b);
        assert_eq!(b.producer_id(), Some(&p));
        assert_eq!(b.producer_sequence_id(), 5);
    }

    #[test]
    fn foreign_message_id_stays_opaque() {
        let id = MessageId::parse("T_sub-0@@session-abc@@1");
        assert!(id.producer_id().is_none());
        assert_eq!(id.to_string(), "T_sub-0@@session-abc@@1");
    }

    #[test]
    fn ordinals_strictly_increase() {
        let seq = LongSequenceGenerator::new();
        let values: Vec<i64> = (0..100).map(|_| seq.next_sequence()).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(values[0], 1);
        assert_eq!(seq.last_sequence(), 100);
    }

    #[test]
    fn generated_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.value().starts_with("ID:osmium-"));
    }
}
