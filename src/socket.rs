//! Datagram substrate.
//!
//! [`Socket`] wraps a `tokio::net::UdpSocket` so callers deal in
//! [`crate::packet::Packet`] instead of raw bytes, with the
//! [`crate::simulator::Impairment`] hook applied in both directions.  All
//! protocol logic lives elsewhere; this module owns only byte I/O.
//!
//! The receive side is a bounded wait: [`Socket::recv_until`] returns either
//! a valid packet or [`Recv::TimedOut`].  Datagrams that the impairment hook
//! drops, or that fail to decode (malformed or checksum mismatch), are logged
//! and discarded without ending the wait.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::packet::{flag_names, Packet, MAX_DATAGRAM};
use crate::simulator::{corrupt, Fault, Impairment, Simulator};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Failures of the underlying datagram socket.
#[derive(Debug, Error)]
pub enum SocketError {
    /// OS-level send/receive/bind failure.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Recv
// ---------------------------------------------------------------------------

/// Outcome of one bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recv {
    /// A packet that passed the checksum, and who sent it.
    Packet(Packet, SocketAddr),
    /// The deadline passed without a usable packet.
    TimedOut,
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, packet-oriented UDP socket with an impairment hook.
///
/// Methods take `&mut self`: the socket is owned by exactly one connection.
pub struct Socket {
    /// Resolved local address (the real port when bound to port 0).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
    impairment: Box<dyn Impairment>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Socket {
    /// Bind a new socket to `local_addr` with no impairment.
    ///
    /// Passing `127.0.0.1:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner,
            impairment: Box::new(Simulator::transparent()),
        })
    }

    /// Replace the impairment hook.
    pub fn with_impairment(mut self, impairment: impl Impairment + 'static) -> Self {
        self.impairment = Box::new(impairment);
        self
    }

    /// Put `packet` on the wire as one datagram addressed to `dest`.
    ///
    /// A packet the impairment hook drops is reported as sent.
    pub async fn send_to(&mut self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        let h = &packet.header;
        let mut bytes = packet.encode();
        match self.impairment.outgoing(packet) {
            Fault::Drop => {
                log::debug!("[sim] dropping outgoing {} seq={} ack={}", flag_names(h.flags), h.seq, h.ack);
                return Ok(());
            }
            Fault::Corrupt => {
                corrupt(&mut bytes);
                log::debug!("[sim] corrupting outgoing {} seq={}", flag_names(h.flags), h.seq);
            }
            Fault::Deliver => {}
        }
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Wait until `deadline` for the next valid packet.
    pub async fn recv_until(&mut self, deadline: Instant) -> Result<Recv, SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, addr) = match timeout_at(deadline, self.inner.recv_from(&mut buf)).await {
                Err(_elapsed) => return Ok(Recv::TimedOut),
                Ok(Ok(received)) => received,
                Ok(Err(e)) if is_transient(&e) => {
                    log::trace!("[sock] ignoring transient receive error: {e}");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };

            let datagram = &mut buf[..n];
            match self.impairment.incoming(datagram) {
                Fault::Drop => {
                    log::debug!("[sim] dropping incoming datagram from {addr}");
                    continue;
                }
                Fault::Corrupt => {
                    corrupt(datagram);
                    log::debug!("[sim] corrupting incoming datagram from {addr}");
                }
                Fault::Deliver => {}
            }

            match Packet::decode(datagram) {
                Ok(packet) => return Ok(Recv::Packet(packet, addr)),
                Err(e) => log::warn!("[sock] discarding datagram from {addr}: {e}"),
            }
        }
    }

    /// Wait at most `timeout` for the next valid packet.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Recv, SocketError> {
        self.recv_until(Instant::now() + timeout).await
    }
}

/// ICMP port-unreachable replies surface as reset/refused on some platforms;
/// for a datagram socket they only mean the peer is not listening yet.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
