use osmium_stomp::{
    BoxError, Connection, Destination, Message, MessageConsumer, MessageProducer, Payload, Session,
};
use std::collections::HashMap;
use std::io::{self, Write};

use super::state::SharedState;

/// Result of executing a command
pub enum CommandResult {
    /// Command executed successfully
    Ok,
    /// Command requests exit
    Quit,
    /// Command succeeded and has something to report
    Info(String),
    /// Error executing command
    Error(String),
}

/// Everything a console command can act on.
pub struct Console {
    pub conn: Connection,
    pub session: Session,
    pub producer: MessageProducer,
    /// Open consumers keyed by the destination as the user typed it
    pub consumers: HashMap<String, MessageConsumer>,
    pub state: SharedState,
}

impl Console {
    /// Subscribe to a destination and print whatever arrives on it.
    pub async fn subscribe(&mut self, dest: &str) -> Result<(), String> {
        if self.consumers.contains_key(dest) {
            return Err(format!("Already subscribed to {}", dest));
        }
        let destination = Destination::parse(dest).map_err(|e| format!("Bad destination '{}': {}", dest, e))?;
        let consumer = self
            .session
            .create_consumer(&destination)
            .await
            .map_err(|e| format!("Failed to subscribe to '{}': {}", dest, e))?;

        let label = destination.to_string();
        let state = self.state.clone();
        consumer
            .set_message_listener(move |message: Message| {
                let label = label.clone();
                let state = state.clone();
                async move {
                    let body = describe_body(&message);
                    print_message(&label, &message, &body);
                    state.lock().record_message(&label, body, message.is_redelivered());
                    Ok::<(), BoxError>(())
                }
            })
            .await
            .map_err(|e| format!("Failed to attach listener to '{}': {}", dest, e))?;

        self.state.lock().register_subscription(&destination.to_string());
        self.consumers.insert(dest.to_string(), consumer);
        Ok(())
    }
}

/// Parse and execute a command
pub async fn execute_command(line: &str, console: &mut Console) -> CommandResult {
    let parts: Vec<&str> = line.trim().splitn(3, ' ').collect();
    if parts.is_empty() || parts[0].is_empty() {
        return CommandResult::Ok;
    }

    match parts[0] {
        "quit" | "exit" | "q" => CommandResult::Quit,

        "send" => {
            if parts.len() < 3 {
                return CommandResult::Error("Usage: send <destination> <message>".to_string());
            }
            let destination = match Destination::parse(parts[1]) {
                Ok(d) => d,
                Err(e) => return CommandResult::Error(format!("Bad destination '{}': {}", parts[1], e)),
            };
            match console.producer.send_to(&destination, Message::text(parts[2])).await {
                Ok(id) => {
                    console.state.lock().sent_count += 1;
                    match console.session.transaction_id() {
                        Some(tx) => CommandResult::Info(format!("Sent {} (in {})", id, tx)),
                        None => CommandResult::Info(format!("Sent {}", id)),
                    }
                }
                Err(e) => CommandResult::Error(format!("Send error: {}", e)),
            }
        }

        "sub" | "subscribe" => {
            if parts.len() < 2 {
                return CommandResult::Error("Usage: sub <destination>".to_string());
            }
            match console.subscribe(parts[1]).await {
                Ok(()) => CommandResult::Info(format!("Subscribed to: {}", parts[1])),
                Err(e) => CommandResult::Error(e),
            }
        }

        "unsub" | "unsubscribe" => {
            if parts.len() < 2 {
                return CommandResult::Error("Usage: unsub <destination>".to_string());
            }
            let Some(consumer) = console.consumers.remove(parts[1]) else {
                return CommandResult::Error(format!("Not subscribed to {}", parts[1]));
            };
            match consumer.close().await {
                Ok(()) => CommandResult::Info(format!("Unsubscribed from: {}", parts[1])),
                Err(e) => CommandResult::Error(format!("Unsubscribe error: {}", e)),
            }
        }

        "ack" => match console.session.acknowledge().await {
            Ok(()) => CommandResult::Info("Acknowledged".to_string()),
            Err(e) => CommandResult::Error(format!("Ack error: {}", e)),
        },

        "recover" => match console.session.recover().await {
            Ok(()) => CommandResult::Info("Unacknowledged messages will be redelivered".to_string()),
            Err(e) => CommandResult::Error(format!("Recover error: {}", e)),
        },

        "commit" => match console.session.commit().await {
            Ok(()) => CommandResult::Ok,
            Err(e) => CommandResult::Error(format!("Commit error: {}", e)),
        },

        "rollback" | "abort" => match console.session.rollback().await {
            Ok(()) => CommandResult::Ok,
            Err(e) => CommandResult::Error(format!("Rollback error: {}", e)),
        },

        "status" => {
            let mut status = format!(
                "Connection {} ({:?}), client id {}",
                console.conn.id(),
                console.conn.state(),
                console.conn.client_id()
            );
            if let Some(tx) = console.session.transaction_id() {
                status.push_str(&format!(", open transaction {}", tx));
            }
            CommandResult::Info(status)
        }

        "about" => {
            print_about();
            CommandResult::Ok
        }

        "summary" | "report" => {
            let full = parts[0] == "report";
            let text = console.state.lock().generate_summary_with_options(full, 80);
            if parts.len() < 2 {
                println!("{}", text);
                return CommandResult::Ok;
            }
            let filename = parts[1];
            let written = std::fs::File::create(filename).and_then(|mut file| writeln!(file, "{}", text));
            match written {
                Ok(()) => CommandResult::Info(format!("{} written to {}", parts[0], filename)),
                Err(e) => CommandResult::Error(format!("Failed to write {}: {}", filename, e)),
            }
        }

        "clear" => {
            console.state.lock().clear_messages();
            CommandResult::Ok
        }

        "help" | "?" => {
            print_help();
            CommandResult::Ok
        }

        _ => CommandResult::Error(format!("Unknown command: {}. Type 'help' for commands.", parts[0])),
    }
}

/// Text shown for a message body; binary payloads are summarised.
fn describe_body(message: &Message) -> String {
    match message.payload() {
        Payload::Text(text) => text.clone(),
        Payload::Bytes(b) => format!("({} bytes, binary)", b.len()),
        Payload::Map(b) => format!("({} bytes, map)", b.len()),
        Payload::Stream(b) => format!("({} bytes, stream)", b.len()),
    }
}

fn print_message(label: &str, message: &Message, body: &str) {
    let id = message
        .message_id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();
    let redelivered = if message.is_redelivered() { " (redelivered)" } else { "" };
    println!("\n[{}] MESSAGE {}{}", label, id, redelivered);
    for (k, v) in message.properties() {
        println!("  {}: {}", k, v);
    }
    if !body.is_empty() {
        println!("  Body: {}", body);
    }
    print!("> ");
    let _ = io::stdout().flush();
}

/// Print help text
pub fn print_help() {
    println!("Commands:");
    println!("  send <destination> <message>  - Send a text message");
    println!("  sub <destination>             - Subscribe to a destination");
    println!("  unsub <destination>           - Close a subscription");
    println!("  ack                           - Acknowledge delivered messages (client/individual)");
    println!("  recover                       - Redeliver unacknowledged messages");
    println!("  commit                        - Commit the open transaction (transacted)");
    println!("  rollback                      - Roll back the open transaction (transacted)");
    println!("  status                        - Show connection and transaction state");
    println!("  about                         - Show copyright and license");
    println!("  summary [file]                - Print session summary (or save to file)");
    println!("  report [file]                 - Full report with message history (or save to file)");
    println!("  clear                         - Clear message history");
    println!("  quit                          - Exit");
}

/// Print about/copyright information
pub fn print_about() {
    println!();
    println!("osmium-stomp v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Licensed under the MIT License.");
    println!();
}
