use osmium_stomp::{AckMode, Connection, ConnectionConfig, Destination, Message};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This example expects a STOMP broker on localhost:61613 (e.g. ActiveMQ or RabbitMQ with the stomp plugin).

    let config = ConnectionConfig::new()
        .login("guest", "guest")
        .heartbeat(10_000, 10_000);
    let conn = Connection::connect("127.0.0.1:61613", config).await?;

    let session = conn.create_session(AckMode::Auto).await?;
    let queue = Destination::queue("test")?;
    let consumer = session.create_consumer(&queue).await?;
    let producer = session.create_producer(Some(&queue)).await?;

    // nothing is delivered to consumers until the connection is started
    conn.start().await?;

    let id = producer
        .send(Message::text("hello from osmium-stomp").with_property("origin", "quickstart"))
        .await?;
    println!("sent {}", id);

    match consumer.receive_timeout(Duration::from_secs(5)).await? {
        Some(message) => println!(
            "received {:?}: {}",
            message.message_id.as_ref().map(|id| id.to_string()),
            message.body_text()?
        ),
        None => println!("timed out waiting for a message"),
    }

    conn.close().await?;
    Ok(())
}
