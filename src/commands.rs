//! Typed protocol commands exchanged between the session layer and the wire
//! format.

use crate::ack::AckMode;
use crate::destination::Destination;
use crate::error::BrokerError;
use crate::ids::{ConnectionId, ConsumerId, MessageId, ProducerId, SessionId, TransactionId};
use crate::message::Message;

/// A command plus its correlation data.
#[derive(Debug, Clone)]
pub struct Command {
    pub command_id: i32,
    pub response_required: bool,
    pub body: CommandBody,
}

impl Command {
    pub fn new(body: CommandBody) -> Self {
        Self {
            command_id: 0,
            response_required: false,
            body,
        }
    }

    pub fn with_response(body: CommandBody) -> Self {
        Self {
            command_id: 0,
            response_required: true,
            body,
        }
    }

    pub fn is_message_dispatch(&self) -> bool {
        matches!(self.body, CommandBody::MessageDispatch(_))
    }

    pub fn name(&self) -> &'static str {
        self.body.name()
    }
}

#[derive(Debug, Clone)]
pub enum CommandBody {
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    Message(Box<Message>),
    MessageDispatch(MessageDispatch),
    MessageAck(MessageAck),
    TransactionInfo(TransactionInfo),
    RemoveInfo(RemoveInfo),
    RemoveSubscriptionInfo(RemoveSubscriptionInfo),
    ShutdownInfo,
    KeepAliveInfo,
    Response(Response),
    ExceptionResponse(ExceptionResponse),
    BrokerError(BrokerError),
}

impl CommandBody {
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::ConnectionInfo(_) => "ConnectionInfo",
            CommandBody::SessionInfo(_) => "SessionInfo",
            CommandBody::ConsumerInfo(_) => "ConsumerInfo",
            CommandBody::ProducerInfo(_) => "ProducerInfo",
            CommandBody::Message(_) => "Message",
            CommandBody::MessageDispatch(_) => "MessageDispatch",
            CommandBody::MessageAck(_) => "MessageAck",
            CommandBody::TransactionInfo(_) => "TransactionInfo",
            CommandBody::RemoveInfo(_) => "RemoveInfo",
            CommandBody::RemoveSubscriptionInfo(_) => "RemoveSubscriptionInfo",
            CommandBody::ShutdownInfo => "ShutdownInfo",
            CommandBody::KeepAliveInfo => "KeepAliveInfo",
            CommandBody::Response(_) => "Response",
            CommandBody::ExceptionResponse(_) => "ExceptionResponse",
            CommandBody::BrokerError(_) => "BrokerError",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub host: Option<String>,
    /// Client heart-beat offer `(send_ms, receive_ms)`.
    pub heartbeat: (u64, u64),
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub ack_mode: AckMode,
    pub selector: Option<String>,
    pub subscription_name: Option<String>,
    pub prefetch_size: i32,
    pub maximum_pending_message_limit: i32,
    pub priority: Option<u8>,
    pub exclusive: bool,
    pub retroactive: bool,
    pub no_local: bool,
    pub dispatch_async: bool,
}

#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub destination: Option<Destination>,
}

#[derive(Debug, Clone)]
pub struct MessageDispatch {
    pub consumer_id: ConsumerId,
    pub destination: Option<Destination>,
    pub message: Message,
    pub redelivery_counter: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// Acknowledges `message_count` messages ending at `last_message_id`.
    Consumed,
    /// Acknowledges exactly one message.
    Individual,
}

#[derive(Debug, Clone)]
pub struct MessageAck {
    pub ack_type: AckType,
    pub consumer_id: ConsumerId,
    pub destination: Option<Destination>,
    pub transaction_id: Option<TransactionId>,
    pub first_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Begin,
    Commit,
    Rollback,
}

#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub transaction_id: TransactionId,
    pub kind: TransactionType,
}

#[derive(Debug, Clone)]
pub enum RemoveInfo {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

#[derive(Debug, Clone)]
pub struct RemoveSubscriptionInfo {
    pub client_id: String,
    pub subscription_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub correlation_id: i32,
}

#[derive(Debug, Clone)]
pub struct ExceptionResponse {
    pub correlation_id: i32,
    pub error: BrokerError,
}
