//! `rudp-stream`: a TCP-like reliable, ordered byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐   DATA seq=n   ┌──────────┐
//!  │  Sender  │───────────────▶│ Receiver │
//!  └────┬─────┘                └─────┬────┘
//!       │        ACK ack=n+1         │
//!       │◀───────────────────────────┘
//!       │
//!  ┌────▼──────────────────────────────┐
//!  │           Connection              │
//!  │  (handshake, teardown, retries)   │
//!  └────┬──────────────────────────────┘
//!       │ packets
//!  ┌────▼──────┐     ┌─────────────┐
//!  │  Socket   │────▶│  Simulator  │  (optional loss / corruption)
//!  └───────────┘     └─────────────┘
//! ```
//!
//! Stop-and-wait: exactly one unacknowledged data unit per direction at a
//! time, so the only hazards are loss and duplication, never reordering.
//!
//! Modules:
//! - [`packet`]: wire format and checksum
//! - [`connection`]: handshake, teardown and stop-and-wait send/receive
//! - [`state`]: finite-state-machine types
//! - [`sender`]: outbound sequence number and in-flight segment
//! - [`receiver`]: inbound duplicate detection and ACK numbers
//! - [`timer`]: exponential back-off and cancellation
//! - [`simulator`]: optional lossy/corrupting network layer for testing
//! - [`socket`]: async UDP socket with bounded-wait receive
//! - [`config`]: transport and impairment settings
//!
//! # Example
//!
//! ```ignore
//! let mut client = Connection::bind(local, Some(server), TransportConfig::default(),
//!                                   ImpairmentConfig::default()).await?;
//! client.connect().await?;
//! client.send_stop_and_wait(b"Hello, server!").await?;
//! client.close().await?;
//! ```

pub mod config;
pub mod connection;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod timer;

pub use config::{ConfigError, ImpairmentConfig, TransportConfig};
pub use connection::{ConnError, Connection};
pub use state::ConnectionState;
pub use timer::CancelToken;
