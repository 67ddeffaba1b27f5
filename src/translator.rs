use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::commands::{
    AckType, Command, CommandBody, ConnectionInfo, ConsumerInfo, ExceptionResponse, MessageAck,
    MessageDispatch, RemoveInfo, RemoveSubscriptionInfo, Response, TransactionInfo,
    TransactionType,
};
use crate::destination::Destination;
use crate::error::{BrokerError, Result, StompError};
use crate::frame::Frame;
use crate::ids::{ConsumerId, MessageId};
use crate::message::{DEFAULT_PRIORITY, Message, Payload};

/// Protocol versions offered in CONNECT.
pub const ACCEPT_VERSION: &str = "1.0,1.1";

/// Receipt prefix for acknowledgements whose RECEIPT is dropped on arrival.
const IGNORE_PREFIX: &str = "ignore:";

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Parameters
/// - `header`: header string from the server or client (for example
///   "10000,10000"). The values represent milliseconds.
///
/// Returns a tuple `(cx, cy)` where each value is the heartbeat interval in
/// milliseconds. Missing or invalid fields default to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Negotiate heartbeat intervals between client and server.
///
/// Returns `(outgoing, incoming)` where each element is `Some(Duration)` if
/// heartbeats are enabled in that direction, or `None` if disabled. A
/// direction is enabled only when both sides offer a non-zero value; the
/// negotiated interval is the maximum of the two.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |mine: u64, theirs: u64| {
        (mine != 0 && theirs != 0).then(|| Duration::from_millis(mine.max(theirs)))
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}

/// Outcome of marshaling one command.
#[derive(Debug)]
pub enum Marshaled {
    /// A frame to write.
    Frame(Frame),
    /// The command has no wire form; answer the caller locally.
    LocalResponse(Response),
    /// A keepalive byte.
    Heartbeat,
    /// Nothing to write and nobody waiting.
    Nothing,
}

/// What the broker told us in CONNECTED.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Negotiated {
    pub version: String,
    pub session: Option<String>,
    pub server: Option<String>,
    pub send_heartbeat: Option<Duration>,
    pub receive_heartbeat: Option<Duration>,
}

/// Translates between typed commands and STOMP frames.
///
/// One instance lives inside each transport I/O task. It remembers the id of
/// the outstanding CONNECT so the CONNECTED reply can be correlated, and it
/// flips the shared codec encoding flag once the broker reports a protocol
/// version above 1.0.
#[derive(Debug)]
pub struct StompWireFormat {
    encoding: Arc<AtomicBool>,
    skip_destination_formatting: bool,
    connect_response_id: Option<i32>,
    client_heartbeat: (u64, u64),
    negotiated: Option<Negotiated>,
}

impl StompWireFormat {
    pub fn new(encoding: Arc<AtomicBool>, skip_destination_formatting: bool) -> Self {
        Self {
            encoding,
            skip_destination_formatting,
            connect_response_id: None,
            client_heartbeat: (0, 0),
            negotiated: None,
        }
    }

    pub fn encoding_enabled(&self) -> bool {
        self.encoding.load(Ordering::Acquire)
    }

    /// Result of the last CONNECTED, if any.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Forget per-connection state before a reconnect.
    pub fn reset(&mut self) {
        self.connect_response_id = None;
        self.negotiated = None;
        self.encoding.store(false, Ordering::Release);
    }

    fn destination(&self, d: &Destination) -> String {
        d.to_wire(self.skip_destination_formatting)
    }

    pub fn marshal(&mut self, command: &Command) -> Result<Marshaled> {
        let frame = match &command.body {
            CommandBody::ConnectionInfo(info) => self.write_connect(command, info),
            CommandBody::ConsumerInfo(info) => self.write_subscribe(command, info),
            CommandBody::Message(message) => self.write_send(command, message)?,
            CommandBody::MessageAck(ack) => self.write_ack(command, ack),
            CommandBody::TransactionInfo(info) => write_transaction(command, info),
            CommandBody::RemoveInfo(RemoveInfo::Consumer(id)) => {
                receipt(Frame::new("UNSUBSCRIBE").header("id", id.to_string()), command)
            }
            CommandBody::RemoveSubscriptionInfo(info) => write_remove_subscription(command, info),
            CommandBody::ShutdownInfo => Frame::new("DISCONNECT"),
            CommandBody::KeepAliveInfo => return Ok(Marshaled::Heartbeat),
            CommandBody::MessageDispatch(_)
            | CommandBody::Response(_)
            | CommandBody::ExceptionResponse(_)
            | CommandBody::BrokerError(_) => {
                return Err(StompError::Protocol(format!(
                    "{} is inbound only",
                    command.name()
                )));
            }
            CommandBody::SessionInfo(_)
            | CommandBody::ProducerInfo(_)
            | CommandBody::RemoveInfo(_) => {
                return Ok(if command.response_required {
                    Marshaled::LocalResponse(Response {
                        correlation_id: command.command_id,
                    })
                } else {
                    Marshaled::Nothing
                });
            }
        };
        if !self.encoding_enabled() {
            check_unescaped(&frame)?;
        }
        Ok(Marshaled::Frame(frame))
    }

    fn write_connect(&mut self, command: &Command, info: &ConnectionInfo) -> Frame {
        self.connect_response_id = Some(command.command_id);
        self.client_heartbeat = info.heartbeat;
        Frame::new("CONNECT")
            .header("client-id", info.client_id.clone())
            .header_opt("login", info.login.clone())
            .header_opt("passcode", info.passcode.clone())
            .header_opt("host", info.host.clone())
            .header("accept-version", ACCEPT_VERSION)
            .header(
                "heart-beat",
                format!("{},{}", info.heartbeat.0, info.heartbeat.1),
            )
    }

    fn write_subscribe(&self, command: &Command, info: &ConsumerInfo) -> Frame {
        let mut frame = Frame::new("SUBSCRIBE")
            .header("destination", self.destination(&info.destination))
            .header("id", info.consumer_id.to_string())
            .header("ack", info.ack_mode.subscribe_header())
            .header_opt("selector", info.selector.clone())
            .header("activemq.prefetchSize", info.prefetch_size.to_string());
        if info.maximum_pending_message_limit != 0 {
            frame = frame.header(
                "activemq.maximumPendingMessageLimit",
                info.maximum_pending_message_limit.to_string(),
            );
        }
        if let Some(name) = &info.subscription_name {
            frame = frame
                .header("activemq.subscriptionName", name.clone())
                .header("durable-subscriber-name", name.clone());
        }
        frame = frame
            .header_opt("activemq.priority", info.priority.map(|p| p.to_string()))
            .header_opt("activemq.exclusive", info.exclusive.then_some("true"))
            .header_opt("activemq.retroactive", info.retroactive.then_some("true"))
            .header_opt("activemq.noLocal", info.no_local.then_some("true"))
            .header("activemq.dispatchAsync", info.dispatch_async.to_string());
        receipt(frame, command)
    }

    fn write_send(&self, command: &Command, message: &Message) -> Result<Frame> {
        let destination = message
            .destination
            .as_ref()
            .ok_or_else(|| StompError::usage("message has no destination"))?;
        let persistent = if message.persistent { "true" } else { "false" };
        let mut frame = Frame::new("SEND")
            .header("destination", self.destination(destination))
            .header_opt(
                "reply-to",
                message.reply_to.as_ref().map(|d| self.destination(d)),
            )
            .header_opt("correlation-id", message.correlation_id.clone())
            .header_opt(
                "expires",
                (message.expiration != 0).then(|| message.expiration.to_string()),
            )
            .header_opt(
                "timestamp",
                (message.timestamp != 0).then(|| message.timestamp.to_string()),
            )
            .header_opt(
                "priority",
                (message.priority != DEFAULT_PRIORITY).then(|| message.priority.to_string()),
            )
            .header_opt("type", message.message_type.clone())
            .header_opt(
                "transaction",
                message.transaction_id.as_ref().map(|t| t.to_string()),
            )
            // brokers differ in which of the two they read
            .header("persistent", persistent)
            .header("NMSXDeliveryMode", persistent);
        if let Some(group) = &message.group_id {
            frame = frame
                .header("JMSXGroupID", group.clone())
                .header("NMSXGroupID", group.clone())
                .header("JMSXGroupSeq", message.group_sequence.to_string())
                .header("NMSXGroupSeq", message.group_sequence.to_string());
        }
        match message.payload() {
            Payload::Text(_) => {}
            Payload::Bytes(b) => {
                frame = frame
                    .header("transformation", "jms-byte")
                    .header("content-length", b.len().to_string());
            }
            Payload::Map(_) => frame = frame.header("transformation", "jms-map-xml"),
            Payload::Stream(_) => frame = frame.header("transformation", "jms-stream-xml"),
        }
        for (k, v) in message.properties() {
            frame = frame.header(k.clone(), v.clone());
        }
        frame = frame.set_body(message.payload().as_bytes().to_vec());
        Ok(receipt(frame, command))
    }

    fn write_ack(&self, command: &Command, ack: &MessageAck) -> Frame {
        let message_id = match ack.ack_type {
            AckType::Individual => ack.first_message_id.as_ref(),
            AckType::Consumed => ack.last_message_id.as_ref(),
        };
        let frame = Frame::new("ACK")
            .header_opt("message-id", message_id.map(|m| m.to_string()))
            .header("subscription", ack.consumer_id.to_string())
            .header_opt("transaction", ack.transaction_id.as_ref().map(|t| t.to_string()));
        if command.response_required {
            frame.header("receipt", command.command_id.to_string())
        } else {
            frame.header("receipt", format!("{}{}", IGNORE_PREFIX, command.command_id))
        }
    }

    /// Convert an inbound frame into a command. `Ok(None)` means the frame
    /// was consumed without producing anything for the connection.
    pub fn unmarshal(&mut self, mut frame: Frame) -> Result<Option<Command>> {
        match frame.command.as_str() {
            "RECEIPT" => Ok(read_receipt(&frame)),
            "CONNECTED" => self.read_connected(&frame).map(Some),
            "ERROR" => Ok(Some(self.read_error(&mut frame))),
            "MESSAGE" => Ok(read_message(frame)),
            other => {
                warn!(command = other, "dropping frame with unknown command");
                Ok(None)
            }
        }
    }

    fn read_connected(&mut self, frame: &Frame) -> Result<Command> {
        let correlation_id = self
            .connect_response_id
            .take()
            .ok_or_else(|| StompError::Protocol("CONNECTED received with no CONNECT pending".into()))?;
        let version = frame.get_header("version").unwrap_or("1.0").to_string();
        let newer = version
            .split(',')
            .filter_map(|v| v.trim().parse::<f32>().ok())
            .any(|v| v > 1.0);
        self.encoding.store(newer, Ordering::Release);
        let (sx, sy) = parse_heartbeat_header(frame.get_header("heart-beat").unwrap_or("0,0"));
        let (cx, cy) = self.client_heartbeat;
        let (send_heartbeat, receive_heartbeat) = negotiate_heartbeats(cx, cy, sx, sy);
        let negotiated = Negotiated {
            version,
            session: frame.get_header("session").map(str::to_string),
            server: frame.get_header("server").map(str::to_string),
            send_heartbeat,
            receive_heartbeat,
        };
        debug!(?negotiated, "broker accepted connection");
        self.negotiated = Some(negotiated);
        Ok(Command::new(CommandBody::Response(Response { correlation_id })))
    }

    fn read_error(&mut self, frame: &mut Frame) -> Command {
        let error = BrokerError::from_parts(frame.remove_header("message"), &frame.body);
        let correlation = match frame.get_header("receipt-id") {
            Some(id) => id.strip_prefix(IGNORE_PREFIX).unwrap_or(id).parse::<i32>().ok(),
            None => self.connect_response_id.take(),
        };
        match correlation {
            Some(correlation_id) => Command::new(CommandBody::ExceptionResponse(ExceptionResponse {
                correlation_id,
                error,
            })),
            None => Command::new(CommandBody::BrokerError(error)),
        }
    }
}

fn receipt(frame: Frame, command: &Command) -> Frame {
    if command.response_required {
        frame.header("receipt", command.command_id.to_string())
    } else {
        frame
    }
}

fn write_transaction(command: &Command, info: &TransactionInfo) -> Frame {
    let verb = match info.kind {
        TransactionType::Begin => "BEGIN",
        TransactionType::Commit => "COMMIT",
        TransactionType::Rollback => "ABORT",
    };
    let frame = Frame::new(verb).header("transaction", info.transaction_id.to_string());
    match info.kind {
        // the outcome of an end must always be confirmed
        TransactionType::Commit | TransactionType::Rollback => {
            frame.header("receipt", command.command_id.to_string())
        }
        TransactionType::Begin => receipt(frame, command),
    }
}

fn write_remove_subscription(command: &Command, info: &RemoveSubscriptionInfo) -> Frame {
    let frame = Frame::new("UNSUBSCRIBE")
        .header("id", info.subscription_name.clone())
        .header("activemq.subscriptionName", info.subscription_name.clone())
        .header("durable-subscriber-name", info.subscription_name.clone())
        .header("client-id", info.client_id.clone());
    receipt(frame, command)
}

fn check_unescaped(frame: &Frame) -> Result<()> {
    for (k, v) in &frame.headers {
        if k.contains('\n') || k.contains(':') || v.contains('\n') {
            return Err(StompError::MessageFormat(format!(
                "header '{}' needs escaping, which protocol 1.0 does not support",
                k.escape_debug()
            )));
        }
    }
    Ok(())
}

fn read_receipt(frame: &Frame) -> Option<Command> {
    let id = frame.get_header("receipt-id")?;
    if id.starts_with(IGNORE_PREFIX) {
        return None;
    }
    match id.parse::<i32>() {
        Ok(correlation_id) => Some(Command::new(CommandBody::Response(Response {
            correlation_id,
        }))),
        Err(_) => {
            warn!(receipt_id = id, "dropping RECEIPT with foreign receipt id");
            None
        }
    }
}

fn read_message(mut frame: Frame) -> Option<Command> {
    let subscription = frame.remove_header("subscription");
    let consumer_id = match subscription.as_deref().map(str::parse::<ConsumerId>) {
        Some(Ok(id)) => id,
        _ => {
            warn!(subscription = ?subscription, "dropping MESSAGE without a known subscription");
            return None;
        }
    };

    let transformation = frame.remove_header("transformation");
    let has_length = frame.remove_header("content-length").is_some();
    let body = std::mem::take(&mut frame.body);
    let payload = match transformation.as_deref() {
        Some(t) if t.starts_with("jms-map") => Payload::Map(body),
        Some(t) if t.starts_with("jms-stream") => Payload::Stream(body),
        Some("jms-byte") => Payload::Bytes(body),
        _ if has_length => Payload::Bytes(body),
        _ => match String::from_utf8(body) {
            Ok(text) => Payload::Text(text),
            Err(e) => Payload::Bytes(e.into_bytes()),
        },
    };

    let mut message = Message::new(payload);
    let destination = frame
        .remove_header("destination")
        .and_then(|d| Destination::parse(&d).ok());
    message.destination = destination.clone();
    message.reply_to = frame
        .remove_header("reply-to")
        .and_then(|d| Destination::parse(&d).ok());
    message.correlation_id = frame.remove_header("correlation-id");
    message.message_id = frame.remove_header("message-id").map(|m| MessageId::parse(&m));
    message.expiration = parse_or(frame.remove_header("expires"), 0);
    message.timestamp = parse_or(frame.remove_header("timestamp"), 0);
    message.priority = parse_or(frame.remove_header("priority"), DEFAULT_PRIORITY);
    message.message_type = frame.remove_header("type");
    let persistent = frame.remove_header("persistent");
    let delivery_mode = frame.remove_header("NMSXDeliveryMode");
    message.persistent = persistent.or(delivery_mode).as_deref() == Some("true");
    if frame.remove_header("redelivered").as_deref() == Some("true") {
        message.redelivery_counter = 1;
    }
    let group = frame.remove_header("JMSXGroupID");
    message.group_id = frame.remove_header("NMSXGroupID").or(group);
    let seq = frame.remove_header("JMSXGroupSeq");
    message.group_sequence = parse_or(frame.remove_header("NMSXGroupSeq").or(seq), 0);
    for (k, v) in frame.headers {
        message.push_property(k, v);
    }

    let redelivery_counter = message.redelivery_counter;
    Some(Command::new(CommandBody::MessageDispatch(MessageDispatch {
        consumer_id,
        destination,
        message,
        redelivery_counter,
    })))
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckMode;
    use crate::ids::{ConnectionId, SessionId, TransactionId};

    fn wire() -> StompWireFormat {
        StompWireFormat::new(Arc::new(AtomicBool::new(false)), false)
    }

    fn connect_command(id: i32) -> Command {
        let mut cmd = Command::with_response(CommandBody::ConnectionInfo(ConnectionInfo {
            connection_id: ConnectionId::new("ID:c-1"),
            client_id: "client-a".into(),
            login: Some("guest".into()),
            passcode: Some("pw".into()),
            host: None,
            heartbeat: (1000, 2000),
        }));
        cmd.command_id = id;
        cmd
    }

    fn frame_of(m: Marshaled) -> Frame {
        match m {
            Marshaled::Frame(f) => f,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn negotiation_requires_both_sides() {
        assert_eq!(negotiate_heartbeats(0, 0, 5000, 5000), (None, None));
        assert_eq!(
            negotiate_heartbeats(1000, 2000, 3000, 500),
            (
                Some(Duration::from_millis(1000)),
                Some(Duration::from_millis(3000))
            )
        );
    }

    #[test]
    fn connect_then_connected_correlates_once() {
        let mut w = wire();
        let f = frame_of(w.marshal(&connect_command(7)).unwrap());
        assert_eq!(f.command, "CONNECT");
        assert_eq!(f.get_header("accept-version"), Some("1.0,1.1"));
        assert_eq!(f.get_header("heart-beat"), Some("1000,2000"));
        assert_eq!(f.get_header("client-id"), Some("client-a"));

        let connected = Frame::new("CONNECTED")
            .header("version", "1.1")
            .header("session", "s-1")
            .header("heart-beat", "0,4000");
        let cmd = w.unmarshal(connected.clone()).unwrap().unwrap();
        match cmd.body {
            CommandBody::Response(r) => assert_eq!(r.correlation_id, 7),
            other => panic!("unexpected {:?}", other),
        }
        assert!(w.encoding_enabled());
        let n = w.negotiated().unwrap();
        assert_eq!(n.session.as_deref(), Some("s-1"));
        assert_eq!(n.send_heartbeat, Some(Duration::from_millis(4000)));
        assert_eq!(n.receive_heartbeat, None);

        assert!(matches!(w.unmarshal(connected), Err(StompError::Protocol(_))));
    }

    #[test]
    fn version_one_zero_keeps_encoding_off() {
        let mut w = wire();
        w.marshal(&connect_command(1)).unwrap();
        w.unmarshal(Frame::new("CONNECTED").header("version", "1.0"))
            .unwrap();
        assert!(!w.encoding_enabled());
    }

    #[test]
    fn commit_forces_receipt_and_shutdown_never_has_one() {
        let mut w = wire();
        let tx = TransactionId::new(&ConnectionId::new("ID:c-1"), 3);
        let mut commit = Command::new(CommandBody::TransactionInfo(TransactionInfo {
            transaction_id: tx.clone(),
            kind: TransactionType::Commit,
        }));
        commit.command_id = 12;
        let f = frame_of(w.marshal(&commit).unwrap());
        assert_eq!(f.command, "COMMIT");
        assert_eq!(f.get_header("transaction"), Some("TX:ID:c-1:3"));
        assert_eq!(f.get_header("receipt"), Some("12"));

        let mut bye = Command::with_response(CommandBody::ShutdownInfo);
        bye.command_id = 13;
        let f = frame_of(w.marshal(&bye).unwrap());
        assert_eq!(f.command, "DISCONNECT");
        assert!(!f.has_header("receipt"));
    }

    #[test]
    fn session_info_is_answered_locally() {
        let mut w = wire();
        let mut cmd = Command::with_response(CommandBody::SessionInfo(crate::commands::SessionInfo {
            session_id: SessionId::new(&ConnectionId::new("ID:c-1"), 1),
        }));
        cmd.command_id = 5;
        match w.marshal(&cmd).unwrap() {
            Marshaled::LocalResponse(r) => assert_eq!(r.correlation_id, 5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn subscribe_headers() {
        let mut w = wire();
        let session = SessionId::new(&ConnectionId::new("ID:c-1"), 1);
        let consumer_id = ConsumerId::new(&session, 2);
        let cmd = Command::new(CommandBody::ConsumerInfo(ConsumerInfo {
            consumer_id,
            destination: Destination::topic("prices").unwrap(),
            ack_mode: AckMode::Individual,
            selector: Some("x = 1".into()),
            subscription_name: Some("durable-1".into()),
            prefetch_size: 100,
            maximum_pending_message_limit: 0,
            priority: None,
            exclusive: true,
            retroactive: false,
            no_local: false,
            dispatch_async: true,
        }));
        let f = frame_of(w.marshal(&cmd).unwrap());
        assert_eq!(f.get_header("destination"), Some("/topic/prices"));
        assert_eq!(f.get_header("id"), Some("ID:c-1:1:2"));
        assert_eq!(f.get_header("ack"), Some("client-individual"));
        assert_eq!(f.get_header("selector"), Some("x = 1"));
        assert_eq!(f.get_header("activemq.prefetchSize"), Some("100"));
        assert_eq!(f.get_header("activemq.subscriptionName"), Some("durable-1"));
        assert_eq!(f.get_header("durable-subscriber-name"), Some("durable-1"));
        assert_eq!(f.get_header("activemq.exclusive"), Some("true"));
        assert!(!f.has_header("activemq.retroactive"));
        assert!(!f.has_header("receipt"));
    }

    #[test]
    fn protocol_one_zero_rejects_newline_headers() {
        let mut w = wire();
        let mut m = Message::text("x").with_property("bad", "a\nb");
        m.destination = Some(Destination::queue("q").unwrap());
        let cmd = Command::new(CommandBody::Message(Box::new(m)));
        assert!(matches!(w.marshal(&cmd), Err(StompError::MessageFormat(_))));
    }

    #[test]
    fn ignored_receipts_are_dropped() {
        let mut w = wire();
        let f = Frame::new("RECEIPT").header("receipt-id", "ignore:9");
        assert!(w.unmarshal(f).unwrap().is_none());
        let f = Frame::new("RECEIPT").header("receipt-id", "9");
        assert!(w.unmarshal(f).unwrap().is_some());
    }

    #[test]
    fn unknown_command_is_dropped() {
        let mut w = wire();
        assert!(w.unmarshal(Frame::new("NACKED")).unwrap().is_none());
    }

    #[test]
    fn error_without_receipt_is_connection_level() {
        let mut w = wire();
        let f = Frame::new("ERROR").header("message", "boom");
        match w.unmarshal(f).unwrap().unwrap().body {
            CommandBody::BrokerError(e) => assert_eq!(e.message, "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn error_during_connect_answers_the_connect() {
        let mut w = wire();
        w.marshal(&connect_command(4)).unwrap();
        let f = Frame::new("ERROR").header("message", "bad login");
        match w.unmarshal(f).unwrap().unwrap().body {
            CommandBody::ExceptionResponse(e) => {
                assert_eq!(e.correlation_id, 4);
                assert_eq!(e.error.message, "bad login");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn message_headers_become_fields_and_properties() {
        let mut w = wire();
        let f = Frame::new("MESSAGE")
            .header("subscription", "ID:c-1:1:2")
            .header("destination", "/queue/orders")
            .header("message-id", "ID:c-9:3:1:5")
            .header("reply-to", "/temp-queue/r")
            .header("expires", "0")
            .header("priority", "7")
            .header("redelivered", "true")
            .header("persistent", "true")
            .header("region", "eu")
            .set_body(b"hello".to_vec());
        let cmd = w.unmarshal(f).unwrap().unwrap();
        let d = match cmd.body {
            CommandBody::MessageDispatch(d) => d,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(d.consumer_id.to_string(), "ID:c-1:1:2");
        assert_eq!(d.redelivery_counter, 1);
        let m = d.message;
        assert_eq!(m.body_text().unwrap(), "hello");
        assert_eq!(m.destination.as_ref().unwrap().to_wire(false), "/queue/orders");
        assert_eq!(m.priority, 7);
        assert!(m.persistent);
        assert!(m.is_redelivered());
        assert_eq!(m.message_id.as_ref().unwrap().producer_sequence_id(), 5);
        assert_eq!(m.properties(), &[("region".to_string(), "eu".to_string())]);
    }

    #[test]
    fn content_length_marks_bytes() {
        let mut w = wire();
        let f = Frame::new("MESSAGE")
            .header("subscription", "ID:c-1:1:2")
            .header("content-length", "2")
            .set_body(vec![0u8, 1]);
        match w.unmarshal(f).unwrap().unwrap().body {
            CommandBody::MessageDispatch(d) => {
                assert_eq!(d.message.payload(), &Payload::Bytes(vec![0, 1]))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
