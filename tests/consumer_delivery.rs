//! Message delivery and acknowledgement through sessions and consumers.

mod common;

use common::{FakeBroker, STEP, config, connect, message, queue, subscribe};
use osmium_stomp::message::now_millis;
use osmium_stomp::{AckMode, BoxError, Message, StompError};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// Synchronous receive
// ============================================================================

#[tokio::test]
async fn auto_ack_acknowledges_each_message() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;
    conn.start().await.unwrap();

    link.deliver(&sub, "m-1", "first").await;
    let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
    assert_eq!(m.body_text().unwrap(), "first");
    assert!(m.is_read_only());
    let ack = link.expect("ACK").await;
    assert_eq!(ack.get_header("message-id"), Some("m-1"));
    assert_eq!(ack.get_header("subscription"), Some(sub.as_str()));
    assert!(ack.get_header("receipt").unwrap().starts_with("ignore:"));

    link.deliver(&sub, "m-2", "second").await;
    consumer.receive_timeout(STEP).await.unwrap().unwrap();
    let ack = link.expect("ACK").await;
    assert_eq!(ack.get_header("message-id"), Some("m-2"));
}

#[tokio::test]
async fn client_acknowledge_covers_everything_delivered() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Client).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;
    conn.start().await.unwrap();

    for (id, body) in [("m-1", "a"), ("m-2", "b"), ("m-3", "c")] {
        link.deliver(&sub, id, body).await;
    }
    for expected in ["a", "b", "c"] {
        let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
        assert_eq!(m.body_text().unwrap(), expected);
    }
    // nothing acknowledged yet
    assert!(link.try_recv(Duration::from_millis(100)).await.is_none());

    consumer.acknowledge().await.unwrap();
    let ack = link.expect("ACK").await;
    assert_eq!(ack.get_header("message-id"), Some("m-3"));
    assert!(link.try_recv(Duration::from_millis(100)).await.is_none());

    // a second acknowledge has nothing left to confirm
    consumer.acknowledge().await.unwrap();
    assert!(link.try_recv(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn individual_ack_confirms_one_message() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Individual).await.unwrap();

    let orders = queue("orders");
    let (consumer, frame) = tokio::join!(
        session.create_consumer(&orders),
        link.expect_receipted("SUBSCRIBE")
    );
    let consumer = consumer.unwrap();
    assert_eq!(frame.get_header("ack"), Some("client-individual"));
    let sub = frame.get_header("id").unwrap().to_string();
    conn.start().await.unwrap();

    link.deliver(&sub, "m-1", "a").await;
    link.deliver(&sub, "m-2", "b").await;
    let _first = consumer.receive_timeout(STEP).await.unwrap().unwrap();
    let second = consumer.receive_timeout(STEP).await.unwrap().unwrap();

    consumer.acknowledge_message(&second).await.unwrap();
    let ack = link.expect("ACK").await;
    assert_eq!(ack.get_header("message-id"), Some("m-2"));

    consumer.acknowledge().await.unwrap();
    let ack = link.expect("ACK").await;
    assert_eq!(ack.get_header("message-id"), Some("m-1"));
}

#[tokio::test]
async fn acknowledge_outside_client_modes_is_a_usage_error() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    for mode in [AckMode::Auto, AckMode::Transacted] {
        let session = conn.create_session(mode).await.unwrap();
        let (consumer, _) = subscribe(&session, &mut link, &queue("orders")).await;
        assert!(matches!(consumer.acknowledge().await, Err(StompError::Usage(_))));
        assert!(matches!(session.acknowledge().await, Err(StompError::Usage(_))));
        assert!(matches!(
            consumer.acknowledge_message(&Message::text("a")).await,
            Err(StompError::Usage(_))
        ));
    }
    assert!(link.try_recv(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn receive_times_out_without_messages() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, _) = subscribe(&session, &mut link, &queue("empty")).await;
    conn.start().await.unwrap();

    let got = consumer
        .receive_timeout(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(got.is_none());
    assert!(consumer.receive_no_wait().await.unwrap().is_none());
}

#[tokio::test]
async fn nothing_is_delivered_before_start() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;

    link.deliver(&sub, "m-1", "early").await;
    let got = consumer
        .receive_timeout(Duration::from_millis(150))
        .await
        .unwrap();
    assert!(got.is_none());

    conn.start().await.unwrap();
    let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
    assert_eq!(m.body_text().unwrap(), "early");
}

#[tokio::test]
async fn unknown_headers_become_properties() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;
    conn.start().await.unwrap();

    link.send(
        message(&sub, "m-1", "x")
            .header("region", "emea")
            .header("correlation-id", "c-7")
            .header("priority", "8"),
    )
    .await;
    let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
    assert_eq!(m.property("region"), Some("emea"));
    assert_eq!(m.correlation_id.as_deref(), Some("c-7"));
    assert_eq!(m.priority, 8);
    assert!(m.property("subscription").is_none());
    assert_eq!(m.destination.as_ref().unwrap().name(), "test");
}

#[tokio::test]
async fn expired_message_is_acknowledged_and_skipped() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;
    conn.start().await.unwrap();

    let long_ago = (now_millis() - 60_000).to_string();
    link.send(message(&sub, "m-old", "stale").header("expires", long_ago))
        .await;
    link.deliver(&sub, "m-new", "fresh").await;

    let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
    assert_eq!(m.body_text().unwrap(), "fresh");
    let first = link.expect("ACK").await;
    assert_eq!(first.get_header("message-id"), Some("m-old"));
    let second = link.expect("ACK").await;
    assert_eq!(second.get_header("message-id"), Some("m-new"));
}

#[tokio::test]
async fn message_for_unknown_subscription_is_dropped() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;
    conn.start().await.unwrap();

    let stranger = format!("{}:99:1", conn.id());
    link.deliver(&stranger, "m-x", "lost").await;
    link.deliver("not-a-subscription", "m-y", "lost").await;
    link.deliver(&sub, "m-1", "kept").await;

    let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
    assert_eq!(m.body_text().unwrap(), "kept");
    assert!(!conn.is_failed());
}

// ============================================================================
// Listeners
// ============================================================================

#[tokio::test]
async fn listener_sees_messages_in_order_and_survives_failures() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .set_message_listener(move |m: Message| {
            let tx = tx.clone();
            async move {
                let body = m.body_text()?.to_string();
                let _ = tx.send(body.clone());
                match body.as_str() {
                    "fail" => Err::<(), BoxError>("listener refused".into()),
                    "panic" => panic!("listener blew up"),
                    _ => Ok(()),
                }
            }
        })
        .await
        .unwrap();
    conn.start().await.unwrap();

    for (i, body) in ["one", "fail", "panic", "two"].iter().enumerate() {
        link.deliver(&sub, &format!("m-{i}"), body).await;
    }
    let mut seen = Vec::new();
    for _ in 0..4 {
        let body = tokio::time::timeout(STEP, rx.recv()).await.unwrap().unwrap();
        seen.push(body);
    }
    assert_eq!(seen, ["one", "fail", "panic", "two"]);

    // every delivery is acknowledged, including the failed ones
    for i in 0..4 {
        let ack = link.expect("ACK").await;
        assert_eq!(ack.get_header("message-id"), Some(format!("m-{i}").as_str()));
    }
}

#[tokio::test]
async fn listener_set_later_gets_buffered_messages_first() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Client).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;
    conn.start().await.unwrap();

    link.deliver(&sub, "m-1", "a").await;
    link.deliver(&sub, "m-2", "b").await;
    let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
    assert_eq!(m.body_text().unwrap(), "a");
    // let "b" land in the consumer buffer
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .set_message_listener(move |m: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(m.body_text()?.to_string());
                Ok(())
            }
        })
        .await
        .unwrap();
    link.deliver(&sub, "m-3", "c").await;

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(tokio::time::timeout(STEP, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, ["b", "c"]);
}

#[tokio::test]
async fn receive_with_listener_is_a_usage_error() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, _) = subscribe(&session, &mut link, &queue("orders")).await;

    consumer
        .set_message_listener(|_m: Message| async { Ok::<(), BoxError>(()) })
        .await
        .unwrap();
    assert!(matches!(
        consumer.receive_no_wait().await,
        Err(StompError::Usage(_))
    ));

    consumer.clear_message_listener().await.unwrap();
    assert!(consumer.receive_no_wait().await.unwrap().is_none());
}

#[tokio::test]
async fn listener_replaced_from_inside_a_listener_never_overlaps() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = consumer.clone();
    consumer
        .set_message_listener(move |m: Message| {
            let handle = handle.clone();
            let tx = tx.clone();
            async move {
                let _ = tx.send(format!("a:{}", m.body_text()?));
                let next = tx.clone();
                handle
                    .set_message_listener(move |m: Message| {
                        let next = next.clone();
                        async move {
                            let _ = next.send(format!("b:{}", m.body_text()?));
                            Ok::<(), BoxError>(())
                        }
                    })
                    .await?;
                // the replacement must not run while this listener is still busy
                tokio::time::sleep(Duration::from_millis(300)).await;
                let _ = tx.send("a:done".to_string());
                Ok::<(), BoxError>(())
            }
        })
        .await
        .unwrap();
    conn.start().await.unwrap();

    link.deliver(&sub, "m-1", "one").await;
    link.deliver(&sub, "m-2", "two").await;
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(tokio::time::timeout(STEP, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, ["a:one", "a:done", "b:two"]);
}

#[tokio::test]
async fn closed_consumer_rejects_receive() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Auto).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;
    conn.start().await.unwrap();

    let waiting = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    consumer.close().await.unwrap();

    let unsubscribe = link.expect("UNSUBSCRIBE").await;
    assert_eq!(unsubscribe.get_header("id"), Some(sub.as_str()));
    assert!(waiting.await.unwrap().unwrap().is_none());
    assert!(consumer.is_closed());
    assert!(matches!(consumer.receive().await, Err(StompError::Usage(_))));
}

// ============================================================================
// Recover
// ============================================================================

#[tokio::test]
async fn recover_redelivers_unacknowledged_messages() {
    let broker = FakeBroker::bind().await;
    let (conn, mut link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Client).await.unwrap();
    let (consumer, sub) = subscribe(&session, &mut link, &queue("orders")).await;
    conn.start().await.unwrap();

    link.deliver(&sub, "m-1", "a").await;
    link.deliver(&sub, "m-2", "b").await;
    for _ in 0..2 {
        let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
        assert!(!m.is_redelivered());
    }

    session.recover().await.unwrap();

    for expected in ["a", "b"] {
        let m = consumer.receive_timeout(STEP).await.unwrap().unwrap();
        assert_eq!(m.body_text().unwrap(), expected);
        assert!(m.is_redelivered());
        assert_eq!(m.redelivery_counter, 1);
    }

    consumer.acknowledge().await.unwrap();
    let ack = link.expect("ACK").await;
    assert_eq!(ack.get_header("message-id"), Some("m-2"));
}

#[tokio::test]
async fn recover_on_transacted_session_is_rejected() {
    let broker = FakeBroker::bind().await;
    let (conn, _link) = connect(&broker, config()).await;
    let session = conn.create_session(AckMode::Transacted).await.unwrap();
    assert!(matches!(session.recover().await, Err(StompError::Usage(_))));
}
