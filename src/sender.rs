//! Send-side bookkeeping: the local sequence number and the one segment
//! that may be awaiting acknowledgement.
//!
//! [`Sender`] tracks the local sequence number and the single in-flight
//! segment.  It does **not** touch the socket; [`crate::connection::Connection`]
//! calls these methods and owns the actual send/receive loop.
//!
//! # Rules
//! - `unacked` holds the only segment allowed on the wire.
//! - The segment carries `seq = next_seq` and is acknowledged by a plain ACK
//!   whose acknowledgement number is `seq + 1`.
//! - On ACK: advance `next_seq` to `seq + 1`; clear `unacked`.
//! - On timeout: resend the same packet unchanged.
//! - On giving up: clear `unacked`; `next_seq` does not move.

use std::time::Instant;

use crate::packet::{flags, Header, Packet, PacketError};

// ---------------------------------------------------------------------------
// RetransmitEntry
// ---------------------------------------------------------------------------

/// A segment that has been staged but not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmitEntry {
    /// Exactly what gets retransmitted.
    pub packet: Packet,
    /// How many times this segment has been transmitted (0 = staged only).
    pub tx_count: u32,
    /// When the segment was staged, for logging the total wait.
    pub staged_at: Instant,
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Outbound half of a connection.
#[derive(Debug, Default)]
pub struct Sender {
    /// Sequence number the **next** data segment will carry.
    ///
    /// Advances by one each time a segment is acknowledged and stays put
    /// while a segment is in flight.
    pub next_seq: u32,

    /// Segment awaiting its ACK, if any.
    pub unacked: Option<RetransmitEntry>,
}

impl Sender {
    pub fn new(isn: u32) -> Self {
        Self {
            next_seq: isn,
            unacked: None,
        }
    }

    /// Start over from a fresh initial sequence number (new handshake).
    pub fn reset(&mut self, isn: u32) {
        self.next_seq = isn;
        self.unacked = None;
    }

    /// Build the data segment for `payload` and place it in the in-flight
    /// slot.  Returns a copy for the caller to transmit.
    ///
    /// A segment still sitting in the slot belongs to a send that never
    /// finished (its future was dropped); it is discarded.
    pub fn stage(&mut self, payload: Vec<u8>, ack: u32) -> Result<Packet, PacketError> {
        if let Some(stale) = self.unacked.take() {
            log::debug!(
                "[send] discarding unfinished seq={} after {} transmissions",
                stale.packet.header.seq,
                stale.tx_count
            );
        }
        let packet = Packet::new(self.next_seq, ack, 0, payload)?;
        self.unacked = Some(RetransmitEntry {
            packet: packet.clone(),
            tx_count: 0,
            staged_at: Instant::now(),
        });
        Ok(packet)
    }

    /// Note one (re)transmission of the in-flight segment.
    pub fn on_transmit(&mut self) {
        if let Some(ref mut e) = self.unacked {
            e.tx_count += 1;
        }
    }

    /// `true` if `header` acknowledges the in-flight segment.
    ///
    /// Handshake SYN|ACKs never count, even when their acknowledgement
    /// number happens to line up.
    pub fn is_ack_for_unacked(&self, header: &Header) -> bool {
        match self.unacked {
            Some(ref e) => {
                header.has(flags::ACK)
                    && !header.has(flags::SYN)
                    && header.ack == e.packet.header.seq.wrapping_add(1)
            }
            None => false,
        }
    }

    /// Process an inbound header.
    ///
    /// Returns `true` if it acknowledges the in-flight segment; `next_seq`
    /// then advances and the slot is cleared.  Anything else is left alone.
    pub fn on_ack(&mut self, header: &Header) -> bool {
        if !self.is_ack_for_unacked(header) {
            return false;
        }
        self.next_seq = header.ack;
        self.unacked = None;
        true
    }

    /// Drop the in-flight segment after the retry budget ran out.
    pub fn abandon(&mut self) -> Option<RetransmitEntry> {
        self.unacked.take()
    }

    /// Transmissions of the current segment so far, the first send
    /// included; `0` while idle.
    pub fn retransmit_count(&self) -> u32 {
        self.unacked.as_ref().map_or(0, |e| e.tx_count)
    }

    /// Is anything still unacknowledged?
    pub fn has_unacked(&self) -> bool {
        self.unacked.is_some()
    }
}
