//! Entry point for `rudp-stream`.
//!
//! Demo endpoints: `server` prints whatever each client delivers, `client`
//! sends a few messages and closes.  The protocol itself lives in the
//! library.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use rudp_stream::{Connection, ImpairmentConfig, TransportConfig};

/// TCP-like reliable byte stream over UDP (stop-and-wait).
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run as a server: accept clients one after another and print what they send.
    Server {
        /// Local address to bind (e.g. 127.0.0.1:10000).
        #[arg(short, long, default_value = "127.0.0.1:10000")]
        bind: SocketAddr,
        #[command(flatten)]
        net: NetArgs,
    },
    /// Run as a client: connect, send each message, then close.
    Client {
        /// Remote server address (e.g. 127.0.0.1:10000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Local address to bind.
        #[arg(short, long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
        /// Message to send; repeat for several.
        #[arg(short, long = "message")]
        messages: Vec<String>,
        #[command(flatten)]
        net: NetArgs,
    },
}

/// Retry and impairment settings shared by both modes.
#[derive(Args)]
struct NetArgs {
    /// Probability of dropping each datagram, in [0, 1].
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Probability of corrupting each datagram, in [0, 1].
    #[arg(long, default_value_t = 0.0)]
    corrupt: f64,
    /// Base per-attempt timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
    /// Attempts for connect, send and receive.
    #[arg(long, default_value_t = 5)]
    retries: u32,
}

impl NetArgs {
    fn transport(&self) -> TransportConfig {
        TransportConfig {
            base_timeout: Duration::from_millis(self.timeout_ms),
            max_retries: self.retries,
            ..TransportConfig::default()
        }
    }

    fn impairment(&self) -> ImpairmentConfig {
        ImpairmentConfig::new(self.loss, self.corrupt)
    }
}

const DEFAULT_MESSAGES: [&str; 3] = [
    "Hello, server!",
    "This is the second message.",
    "Final message. Bye!",
];

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default `info` level.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server { bind, net } => run_server(bind, &net).await,
        Mode::Client {
            server,
            bind,
            messages,
            net,
        } => run_client(server, bind, messages, &net).await,
    }
}

async fn run_server(bind: SocketAddr, net: &NetArgs) -> Result<()> {
    let mut conn = Connection::bind(bind, None, net.transport(), net.impairment())
        .await
        .with_context(|| format!("failed to start server on {bind}"))?;
    log::info!("Listening on {}", conn.local_addr());

    loop {
        let peer = conn.accept().await.context("accept failed")?;
        log::info!("Client {peer} connected");

        loop {
            match conn.receive_stop_and_wait().await {
                Ok(Some(data)) => log::info!("Received: {}", String::from_utf8_lossy(&data)),
                Ok(None) => {
                    log::info!("Client {peer} closed the connection");
                    break;
                }
                Err(e) => {
                    log::warn!("Dropping client {peer}: {e}");
                    break;
                }
            }
        }
    }
}

async fn run_client(
    server: SocketAddr,
    bind: SocketAddr,
    messages: Vec<String>,
    net: &NetArgs,
) -> Result<()> {
    let mut conn = Connection::bind(bind, Some(server), net.transport(), net.impairment())
        .await
        .with_context(|| format!("failed to bind client on {bind}"))?;
    log::info!("Starting client on {}, connecting to {server}", conn.local_addr());

    conn.connect()
        .await
        .with_context(|| format!("could not connect to {server}"))?;
    log::info!("Connected to {server}");

    let messages = if messages.is_empty() {
        DEFAULT_MESSAGES.iter().map(|m| m.to_string()).collect()
    } else {
        messages
    };
    for msg in &messages {
        conn.send_stop_and_wait(msg.as_bytes())
            .await
            .with_context(|| format!("failed to deliver {msg:?}"))?;
        log::info!("Delivered: {msg}");
    }

    conn.close().await.context("close failed")?;
    log::info!("Connection closed");
    Ok(())
}
