//! Optional fault injection for exercising the protocol under loss and
//! corruption.
//!
//! Real networks drop and damage packets, but loopback almost never does.
//! The [`crate::socket::Socket`] consults an [`Impairment`] hook on every
//! datagram it sends or receives:
//!
//! | Fault     | Outgoing                               | Incoming                          |
//! |-----------|----------------------------------------|-----------------------------------|
//! | `Drop`    | never put on the wire                  | discarded before decoding         |
//! | `Corrupt` | trailing byte flipped before sending   | trailing byte flipped before decoding |
//!
//! A dropped send is invisible to the sender; it only finds out through the
//! normal ACK timeout.  A corrupted datagram surfaces to
//! [`crate::packet::Packet::decode`] as a checksum mismatch (the 16-bit
//! checksum makes a miss possible, if rare).
//!
//! [`Simulator`] is the probabilistic implementation driven by an
//! [`ImpairmentConfig`]; tests can plug in scripted hooks instead.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::config::ImpairmentConfig;
use crate::packet::Packet;

/// What to do with one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Pass through untouched.
    Deliver,
    /// Silently discard.
    Drop,
    /// Flip the trailing byte.
    Corrupt,
}

/// Per-datagram fault decision hook.
pub trait Impairment: Send {
    /// Decide the fate of a packet about to be sent.
    fn outgoing(&mut self, packet: &Packet) -> Fault;

    /// Decide the fate of a datagram that just arrived, before decoding.
    fn incoming(&mut self, datagram: &[u8]) -> Fault;
}

/// Probabilistic loss/corruption model.
///
/// The loss decision is made first; only a datagram that survives it is
/// considered for corruption.
pub struct Simulator {
    pub config: ImpairmentConfig,
    rng: Box<dyn RngCore + Send>,
}

impl Simulator {
    /// Simulator seeded from the OS.
    pub fn new(config: ImpairmentConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Simulator drawing its decisions from `rng`; use a seeded generator
    /// for reproducible runs.
    pub fn with_rng(config: ImpairmentConfig, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            config,
            rng: Box::new(rng),
        }
    }

    /// A pass-through simulator that never injects faults.
    pub fn transparent() -> Self {
        Self::new(ImpairmentConfig::default())
    }

    fn decide(&mut self) -> Fault {
        if self.rng.random::<f64>() < self.config.loss_probability {
            Fault::Drop
        } else if self.rng.random::<f64>() < self.config.corruption_probability {
            Fault::Corrupt
        } else {
            Fault::Deliver
        }
    }
}

impl Impairment for Simulator {
    fn outgoing(&mut self, _packet: &Packet) -> Fault {
        self.decide()
    }

    fn incoming(&mut self, _datagram: &[u8]) -> Fault {
        self.decide()
    }
}

/// Damage an encoded datagram so that it can no longer pass the checksum.
///
/// Flips every bit of the trailing byte: the last payload byte, or the low
/// byte of `payload_len` for a control packet.  Both are covered by the
/// checksum.
pub fn corrupt(datagram: &mut [u8]) {
    if let Some(last) = datagram.last_mut() {
        *last ^= 0xff;
    }
}
