//! A scripted in-process broker for integration tests.
//!
//! Tests drive the broker side by hand: accept a link, read the frames the
//! client wrote and answer them.

#![allow(dead_code)]

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use osmium_stomp::codec::{StompCodec, StompItem};
use osmium_stomp::transport::{BoxedStream, Connector, TcpConnector};
use osmium_stomp::{
    Connection, ConnectionConfig, Destination, Frame, MessageConsumer, Session, TransportOptions,
};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

pub const STEP: Duration = Duration::from_secs(5);

pub struct FakeBroker {
    listener: TcpListener,
    pub addr: String,
}

impl FakeBroker {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        Self { listener, addr }
    }

    pub async fn accept(&self) -> BrokerLink {
        let (stream, _) = tokio::time::timeout(STEP, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        BrokerLink {
            framed: Framed::new(stream, StompCodec::new()),
        }
    }
}

pub struct BrokerLink {
    framed: Framed<TcpStream, StompCodec>,
}

impl BrokerLink {
    /// Next frame from the client, skipping heartbeats.
    pub async fn recv(&mut self) -> Frame {
        self.try_recv(STEP).await.expect("no frame from client")
    }

    pub async fn try_recv(&mut self, wait: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.framed.next()).await {
                Err(_) => return None,
                Ok(None) => return None,
                Ok(Some(Ok(StompItem::Heartbeat))) => continue,
                Ok(Some(Ok(StompItem::Frame(f)))) => return Some(f),
                Ok(Some(Err(e))) => panic!("client wrote garbage: {e}"),
            }
        }
    }

    pub async fn expect(&mut self, command: &str) -> Frame {
        let frame = self.recv().await;
        assert_eq!(frame.command, command, "unexpected frame: {frame}");
        frame
    }

    /// Expect a frame and confirm it if it asked for a receipt.
    pub async fn expect_receipted(&mut self, command: &str) -> Frame {
        let frame = self.expect(command).await;
        self.receipt(&frame).await;
        frame
    }

    pub async fn receipt(&mut self, frame: &Frame) {
        if let Some(id) = frame.get_header("receipt") {
            if !id.starts_with("ignore:") {
                let id = id.to_string();
                self.send(Frame::new("RECEIPT").header("receipt-id", id)).await;
            }
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(StompItem::Frame(frame)).await.unwrap();
    }

    /// Answer CONNECT with a 1.1 CONNECTED.
    pub async fn handshake(&mut self) -> Frame {
        let connect = self.expect("CONNECT").await;
        self.send(
            Frame::new("CONNECTED")
                .header("version", "1.1")
                .header("session", "fake-1")
                .header("server", "fake-broker/1.0"),
        )
        .await;
        connect
    }

    pub async fn deliver(&mut self, subscription: &str, message_id: &str, body: &str) {
        self.send(message(subscription, message_id, body)).await;
    }
}

pub fn message(subscription: &str, message_id: &str, body: &str) -> Frame {
    Frame::new("MESSAGE")
        .header("subscription", subscription)
        .header("message-id", message_id)
        .header("destination", "/queue/test")
        .set_body(body.as_bytes().to_vec())
}

pub fn config() -> ConnectionConfig {
    ConnectionConfig::new()
        .client_id("test-client")
        .request_timeout(Duration::from_secs(5))
        .close_timeout(Duration::from_secs(1))
}

/// Connect a client to `broker` and complete the handshake on both ends.
pub async fn connect(broker: &FakeBroker, config: ConnectionConfig) -> (Connection, BrokerLink) {
    let (conn, link) = tokio::join!(Connection::connect(&broker.addr, config), async {
        let mut link = broker.accept().await;
        link.handshake().await;
        link
    });
    (conn.unwrap(), link)
}

/// Create a consumer on `destination`, confirm its SUBSCRIBE and return the
/// subscription id the broker must put on MESSAGE frames.
pub async fn subscribe(
    session: &Session,
    link: &mut BrokerLink,
    destination: &Destination,
) -> (MessageConsumer, String) {
    let (consumer, frame) = tokio::join!(
        session.create_consumer(destination),
        link.expect_receipted("SUBSCRIBE")
    );
    let id = frame.get_header("id").expect("SUBSCRIBE without id").to_string();
    (consumer.unwrap(), id)
}

pub fn queue(name: &str) -> Destination {
    Destination::queue(name).unwrap()
}

/// Connector that refuses the first `failures` attempts.
pub struct FlakyConnector {
    inner: TcpConnector,
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

impl FlakyConnector {
    pub fn new(addr: &str, failures: usize) -> (Arc<Self>, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(Self {
            inner: TcpConnector::new(addr, TransportOptions::default()),
            failures,
            attempts: attempts.clone(),
        });
        (connector, attempts)
    }
}

impl Connector for FlakyConnector {
    fn connect(&self) -> BoxFuture<'static, io::Result<BoxedStream>> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Box::pin(async {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused by test"))
            });
        }
        self.inner.connect()
    }

    fn describe(&self) -> String {
        "flaky".to_string()
    }
}
