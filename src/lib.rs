//! Session-oriented async STOMP client.
//!
//! [`Connection`] → [`Session`] → [`MessageConsumer`] / [`MessageProducer`],
//! with client, individual and transacted acknowledgement, local
//! redelivery and transparent reconnects.

mod ack;
pub mod codec;
pub mod commands;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod destination;
mod dispatch;
pub mod error;
pub mod frame;
pub mod ids;
mod latch;
pub mod message;
pub mod parser;
pub mod producer;
pub mod session;
pub mod transaction;
pub mod translator;
pub mod transport;
mod work_queue;

pub use ack::AckMode;
pub use codec::{DEFAULT_MAX_FRAME_SIZE, StompCodec, StompItem};
pub use config::{
    ConnectionConfig, ConsumerOptions, PrefetchPolicy, ReconnectPolicy, RedeliveryPolicy,
    TransportOptions,
};
pub use connection::{Connection, ConnectionState};
pub use consumer::{BoxError, MessageConsumer};
pub use destination::{Destination, DestinationKind};
pub use error::{BrokerError, Result, StompError};
pub use frame::Frame;
pub use ids::{ConnectionId, ConsumerId, MessageId, ProducerId, SessionId, TransactionId};
pub use message::{Message, Payload};
pub use producer::MessageProducer;
pub use session::Session;
pub use transaction::Synchronization;
pub use translator::{negotiate_heartbeats, parse_heartbeat_header};
pub use transport::{BoxedStream, Connector, TcpConnector};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_frame_display() {
        let f = Frame::new("SEND")
            .header("destination", "/queue/a")
            .set_body(b"hello".to_vec());
        let s = format!("{}", f);
        assert!(s.contains("SEND"));
        assert!(s.contains("Body (5 bytes)"));
    }
}
