use osmium_stomp::{AckMode, Connection, ConnectionConfig, Destination, Message, RedeliveryPolicy};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This example expects a STOMP broker on localhost:61613 (e.g. ActiveMQ or RabbitMQ with the stomp plugin).

    let config = ConnectionConfig::new()
        .login("guest", "guest")
        .redelivery_policy(RedeliveryPolicy::default().initial_delay(Duration::from_millis(500)));
    let conn = Connection::connect("127.0.0.1:61613", config).await?;

    let session = conn.create_session(AckMode::Transacted).await?;
    session.on_transaction_started(|tx| println!("{} started", tx));
    session.on_transaction_committed(|tx| println!("{} committed", tx));
    session.on_transaction_rolled_back(|tx| println!("{} rolled back", tx));

    let queue = Destination::queue("test")?;
    let producer = session.create_producer(Some(&queue)).await?;
    let consumer = session.create_consumer(&queue).await?;
    conn.start().await?;

    // The first send begins a transaction; both messages are delivered atomically on commit.
    producer.send(Message::text("message 1 in transaction")).await?;
    producer.send(Message::text("message 2 in transaction")).await?;
    session.commit().await?;

    // Consume them inside a second transaction, then roll back: both come back
    // marked as redelivered, ahead of anything new.
    for _ in 0..2 {
        if let Some(m) = consumer.receive_timeout(Duration::from_secs(5)).await? {
            println!("received: {}", m.body_text()?);
        }
    }
    if session.transaction_id().is_some() {
        session.rollback().await?;
    }

    for _ in 0..2 {
        if let Some(m) = consumer.receive_timeout(Duration::from_secs(5)).await? {
            println!("redelivered={} {}", m.is_redelivered(), m.body_text()?);
        }
    }
    // this time the acknowledgements stick
    if session.transaction_id().is_some() {
        session.commit().await?;
    }

    conn.close().await?;
    Ok(())
}
