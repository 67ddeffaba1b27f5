use osmium_stomp::{
    AckMode, Connection, ConnectionConfig, ReconnectPolicy, StompError, TransportOptions,
    parse_heartbeat_header,
};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use tokio::sync::mpsc;

use super::args::Cli;
use super::commands::{CommandResult, Console, execute_command, print_help};
use super::exit_codes;
use super::state::SharedState;

/// Run the line-oriented console
pub async fn run(cli: &Cli) -> Result<(), (String, u8)> {
    println!("Connecting to {}...", cli.address);

    let conn = Connection::connect(&cli.address, build_config(cli))
        .await
        .map_err(|e| format_connection_error(&e, &cli.address))?;

    println!("Connected as {}.", conn.client_id());

    let ack_mode = AckMode::from(cli.ack);
    let state = SharedState::new(
        cli.address.clone(),
        cli.login.clone(),
        format!("{:?}", ack_mode).to_lowercase(),
    );
    install_listeners(&conn, &state);

    let session = conn.create_session(ack_mode).await.map_err(protocol_error)?;
    watch_transactions(&session, &state);
    let producer = session.create_producer(None).await.map_err(protocol_error)?;

    let mut console = Console {
        conn: conn.clone(),
        session,
        producer,
        consumers: HashMap::new(),
        state: state.clone(),
    };

    for dest in &cli.subscribe {
        console
            .subscribe(dest)
            .await
            .map_err(|msg| (msg, exit_codes::PROTOCOL_ERROR))?;
        println!("Subscribed to: {}", dest);
    }
    conn.start().await.map_err(protocol_error)?;

    // Channel to receive user commands from stdin reader
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<String>(16);

    // Spawn blocking stdin reader
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if cmd_tx.blocking_send(l).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    println!();
    print_help();
    println!();

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let line = tokio::select! {
            line = cmd_rx.recv() => match line {
                Some(l) => l,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };

        match execute_command(&line, &mut console).await {
            CommandResult::Ok => {}
            CommandResult::Quit => break,
            CommandResult::Info(msg) => println!("{}", msg),
            CommandResult::Error(msg) => eprintln!("{}", msg),
        }
    }

    println!("Disconnecting...");
    if cli.summary {
        println!("{}", state.lock().generate_summary());
    }
    if let Err(e) = conn.close().await {
        eprintln!("Close error: {}", e);
    }
    Ok(())
}

fn build_config(cli: &Cli) -> ConnectionConfig {
    let (send_ms, receive_ms) = parse_heartbeat_header(&cli.heartbeat);
    let mut transport = TransportOptions::default();
    if cli.reconnect {
        transport = transport.reconnect(ReconnectPolicy::default());
    }
    let mut config = ConnectionConfig::new()
        .login(cli.login.clone(), cli.passcode.clone())
        .heartbeat(send_ms, receive_ms)
        .transport(transport);
    if let Some(vhost) = &cli.vhost {
        config = config.host(vhost.clone());
    }
    if let Some(id) = &cli.client_id {
        config = config.client_id(id.clone());
    }
    config
}

fn install_listeners(conn: &Connection, state: &SharedState) {
    conn.set_exception_listener(|e| {
        eprintln!("\n[CONNECTION FAILED] {}", e);
        if let StompError::Broker(broker) = e {
            for cause in broker.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
        }
    });

    let interrupted = state.clone();
    conn.set_transport_interrupted_listener(move || {
        interrupted.lock().interruptions += 1;
        eprintln!("\n[TRANSPORT INTERRUPTED] reconnecting...");
    });
    conn.set_transport_resumed_listener(|| {
        eprintln!("\n[TRANSPORT RESUMED]");
        print!("> ");
        let _ = io::stdout().flush();
    });
}

fn watch_transactions(session: &osmium_stomp::Session, state: &SharedState) {
    session.on_transaction_started(|tx| println!("[{}] begun", tx));
    let committed = state.clone();
    session.on_transaction_committed(move |tx| {
        committed.lock().commits += 1;
        println!("[{}] committed", tx);
    });
    let rolled_back = state.clone();
    session.on_transaction_rolled_back(move |tx| {
        rolled_back.lock().rollbacks += 1;
        println!("[{}] rolled back", tx);
    });
}

fn protocol_error(err: StompError) -> (String, u8) {
    (format!("Protocol error: {}", err), exit_codes::PROTOCOL_ERROR)
}

/// Format a connection error with user-friendly messaging
fn format_connection_error(err: &StompError, address: &str) -> (String, u8) {
    match err {
        StompError::Io(io_err) => {
            let message = match io_err.kind() {
                io::ErrorKind::ConnectionRefused => format!("Connection refused: {}", address),
                io::ErrorKind::TimedOut => format!("Connection timed out: {}", address),
                _ => format!("Connection failed: {}", io_err),
            };
            (message, exit_codes::NETWORK_ERROR)
        }
        StompError::ConnectTimeout { last_error, .. } => (
            format!("Could not reach {}: {}", address, last_error),
            exit_codes::NETWORK_ERROR,
        ),
        StompError::ConnectionFailed(reason) => (
            format!("Connection failed: {}", reason),
            exit_codes::NETWORK_ERROR,
        ),
        StompError::Broker(broker) => (
            format!("Authentication failed: {}", broker),
            exit_codes::AUTH_ERROR,
        ),
        other => (format!("Protocol error: {}", other), exit_codes::PROTOCOL_ERROR),
    }
}
