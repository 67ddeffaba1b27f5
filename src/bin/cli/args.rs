use clap::{Parser, ValueEnum};
use osmium_stomp::AckMode;

#[derive(Parser)]
#[command(name = "stomp")]
#[command(version)]
#[command(about = "Line-oriented STOMP console")]
pub struct Cli {
    /// STOMP broker address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:61613")]
    pub address: String,

    /// Login username
    #[arg(short, long, default_value = "guest")]
    pub login: String,

    /// Passcode
    #[arg(short, long, default_value = "guest")]
    pub passcode: String,

    /// Virtual host sent in the CONNECT frame
    #[arg(long)]
    pub vhost: Option<String>,

    /// Client id (generated when omitted)
    #[arg(long)]
    pub client_id: Option<String>,

    /// Heartbeat settings (client-send,client-receive in ms)
    #[arg(long, default_value = "10000,10000")]
    pub heartbeat: String,

    /// Acknowledgement mode of the console session
    #[arg(long, value_enum, default_value_t = AckArg::Auto)]
    pub ack: AckArg,

    /// Reconnect transparently when the broker connection drops
    #[arg(long)]
    pub reconnect: bool,

    /// Destinations to subscribe to (can be specified multiple times)
    #[arg(short, long)]
    pub subscribe: Vec<String>,

    /// Show session summary on exit
    #[arg(long)]
    pub summary: bool,

    /// Log client internals to stderr (overridden by RUST_LOG)
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AckArg {
    Auto,
    Client,
    Individual,
    Transacted,
}

impl From<AckArg> for AckMode {
    fn from(arg: AckArg) -> Self {
        match arg {
            AckArg::Auto => AckMode::Auto,
            AckArg::Client => AckMode::Client,
            AckArg::Individual => AckMode::Individual,
            AckArg::Transacted => AckMode::Transacted,
        }
    }
}
