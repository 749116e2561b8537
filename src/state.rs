//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy.  Transitions live in [`crate::connection`]:
//!
//! ```text
//!            connect()                 SYN|ACK rcvd, ACK sent
//!   CLOSED ────────────▶ SYN_SENT ──────────────────────────┐
//!     │  ▲                                                   ▼
//!     │  │   ACK of local FIN / peer FIN rcvd           ESTABLISHED
//!     │  └───────────────────────────────────────────────────┤
//!     │   SYN rcvd, SYN|ACK sent                             │
//!     └───────────────────────▶ SYN_RECEIVED ──final ACK─────┘
//! ```
//!
//! A failed `connect` falls back from `SynSent` to `Closed`.

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection exists; initial and final state.
    #[default]
    Closed,
    /// SYN has been sent; waiting for SYN|ACK.
    SynSent,
    /// SYN received; SYN|ACK sent; waiting for the final ACK.
    SynReceived,
    /// Three-way handshake complete; data transfer in progress.
    Established,
}

impl ConnectionState {
    /// `true` strictly between a completed handshake and a completed (or
    /// received) teardown.
    pub fn is_connected(self) -> bool {
        self == Self::Established
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
        };
        f.write_str(name)
    }
}
