//! Inbound segment classification for stop-and-wait.
//!
//! Only one segment is ever in flight per direction, so segments cannot
//! arrive out of order; they can only be lost or repeated.  Exact
//! sequence-number match against the last delivered segment is therefore
//! enough to recognise a retransmission whose ACK went missing.
//!
//! The [`Receiver`] does **not** send ACKs itself; it tells
//! [`crate::connection::Connection`] what an arriving segment is and which
//! acknowledgement number to answer with.

use crate::packet::{flags, Header};

/// What an inbound packet means to the receive side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Peer is closing the stream.
    Fin,
    /// Data not seen before; deliver it.
    New,
    /// Retransmission of the last delivered segment; re-ACK, don't deliver.
    Duplicate,
    /// Handshake or acknowledgement traffic; not data.
    Control,
}

/// Receive-side state of a single connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receiver {
    /// Next sequence number expected from the peer.
    ///
    /// Set to `peer_isn + 1` by the handshake and to `seq + 1` after each
    /// delivered segment.
    pub ack_num: u32,

    /// Sequence number of the last segment handed to the application.
    pub last_delivered: Option<u32>,
}

impl Receiver {
    /// Start over after a handshake with a peer whose ISN is `peer_isn`.
    pub fn reset(&mut self, peer_isn: u32) {
        self.ack_num = peer_isn.wrapping_add(1);
        self.last_delivered = None;
    }

    /// Classify an inbound header.
    pub fn classify(&self, header: &Header) -> Segment {
        if header.has(flags::FIN) {
            Segment::Fin
        } else if header.flags & (flags::SYN | flags::ACK) != 0 {
            Segment::Control
        } else if self.last_delivered == Some(header.seq) {
            Segment::Duplicate
        } else {
            Segment::New
        }
    }

    /// Record delivery of the segment with sequence number `seq`.
    ///
    /// Returns the acknowledgement number to answer with.
    pub fn on_delivered(&mut self, seq: u32) -> u32 {
        self.last_delivered = Some(seq);
        self.ack_num = ack_for(seq);
        self.ack_num
    }
}

/// Acknowledgement number that answers a segment with sequence `seq`.
pub fn ack_for(seq: u32) -> u32 {
    seq.wrapping_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn data(seq: u32) -> Header {
        Packet::new(seq, 0, 0, b"payload".to_vec()).unwrap().header
    }

    #[test]
    fn first_segment_is_new_then_duplicate() {
        let mut r = Receiver::default();
        r.reset(41);
        assert_eq!(r.ack_num, 42);
        assert_eq!(r.classify(&data(41)), Segment::New);
        assert_eq!(r.on_delivered(41), 42);
        assert_eq!(r.classify(&data(41)), Segment::Duplicate);
        assert_eq!(r.classify(&data(42)), Segment::New);
    }

    #[test]
    fn fin_wins_over_everything() {
        let r = Receiver::default();
        let fin = Packet::control(3, 0, flags::FIN | flags::ACK).header;
        assert_eq!(r.classify(&fin), Segment::Fin);
    }

    #[test]
    fn handshake_traffic_is_control() {
        let r = Receiver::default();
        for f in [flags::SYN, flags::ACK, flags::SYN | flags::ACK] {
            assert_eq!(r.classify(&Packet::control(0, 0, f).header), Segment::Control);
        }
    }

    #[test]
    fn reset_forgets_last_delivered() {
        let mut r = Receiver::default();
        r.on_delivered(9);
        r.reset(100);
        assert_eq!(r.last_delivered, None);
        assert_eq!(r.classify(&data(9)), Segment::New);
    }

    #[test]
    fn ack_wraps() {
        assert_eq!(ack_for(u32::MAX), 0);
    }
}
