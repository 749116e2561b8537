//! Packet codec: the 13-byte header, its flags and the truncated CRC.
//!
//! [`Packet::encode`] turns a packet into the bytes of one UDP datagram and
//! [`Packet::decode`] goes the other way, refusing anything shorter than a
//! header or carrying a checksum that does not match.  Nothing in here
//! touches a socket, and nothing above it ever sees a packet that failed
//! the checksum.
//!
//! # Wire format
//!
//! Integers go out in network (big-endian) order.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |           Checksum            |  Payload Len  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  (Len cont.)  |               Payload ...                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 13 bytes.
//! seq(4) + ack(4) + flags(1) + checksum(2) + payload_len(2)
//!
//! # Checksum
//!
//! CRC-32 (IEEE) truncated to its low 16 bits, computed over
//! `seq ‖ ack ‖ flags ‖ payload_len` (big-endian, checksum field excluded)
//! followed by the payload bytes.  Because the declared payload length is
//! part of the input, flipping the trailing byte of a zero-payload control
//! packet is still detected.

use thiserror::Error;

/// Control bits carried in the `flags` byte.
pub mod flags {
    /// Opens a connection; carries the sender's ISN.
    pub const SYN: u8 = 0b0000_0001;
    /// The `ack` field is meaningful.
    pub const ACK: u8 = 0b0000_0010;
    /// Sender is done; closes the stream.
    pub const FIN: u8 = 0b0000_0100;
}

/// Size of the header that precedes every payload.
pub const HEADER_LEN: usize = 13;

/// Largest datagram either side will read off the socket.
pub const MAX_DATAGRAM: usize = 5000;

/// Largest payload that fits in a single datagram.  There is no
/// fragmentation: anything bigger is refused by [`Packet::new`].
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

// Field offsets inside the header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_CHECKSUM: usize = 9;
const OFF_PAYLOAD_LEN: usize = 11;

/// Decoded header fields, in host byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Logical position of this data or control unit in the sender's stream.
    pub seq: u32,
    /// Next sequence number the sender of this packet expects to receive.
    pub ack: u32,
    /// Any combination of [`flags`] bits; zero marks a data segment.
    pub flags: u8,
    /// Truncated CRC-32 over the other header fields and the payload.
    ///
    /// On encode this is computed from the packet contents.
    /// On decode this holds the value read off the wire (already verified).
    pub checksum: u16,
    /// Declared payload size.
    pub payload_len: u16,
}

impl Header {
    /// `true` when every bit of `flag` is set.
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }
}

/// One datagram's worth of header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet, filling in `payload_len` and `checksum`.
    ///
    /// Fails with [`PacketError::PayloadTooLarge`] when `payload` does not
    /// fit in one datagram.
    pub fn new(seq: u32, ack: u32, flags: u8, payload: Vec<u8>) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge { len: payload.len() });
        }
        let payload_len = payload.len() as u16;
        Ok(Self {
            header: Header {
                seq,
                ack,
                flags,
                checksum: checksum(seq, ack, flags, payload_len, &payload),
                payload_len,
            },
            payload,
        })
    }

    /// A payload-free control packet (SYN, ACK, FIN or a combination).
    pub fn control(seq: u32, ack: u32, flags: u8) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                flags,
                checksum: checksum(seq, ack, flags, 0, &[]),
                payload_len: 0,
            },
            payload: Vec::new(),
        }
    }

    /// Wire bytes for this packet.
    ///
    /// `payload_len` and `checksum` are recomputed from the actual payload;
    /// whatever is stored in those header fields is ignored.
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let payload_len = self.payload.len() as u16;
        let csum = checksum(h.seq, h.ack, h.flags, payload_len, &self.payload);

        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&h.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&h.ack.to_be_bytes());
        buf[OFF_FLAGS] = h.flags;
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2].copy_from_slice(&payload_len.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Rebuild a packet from one received datagram.
    ///
    /// The payload is sliced to the declared length (bytes past it are
    /// ignored; a short buffer yields a short payload, which then fails the
    /// checksum).  Fails with [`PacketError::Malformed`] below
    /// [`HEADER_LEN`] bytes and with [`PacketError::ChecksumMismatch`] when
    /// the stored checksum is wrong.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Malformed { len: buf.len() });
        }

        let seq = read_u32(buf, OFF_SEQ);
        let ack = read_u32(buf, OFF_ACK);
        let flags = buf[OFF_FLAGS];
        let stored = read_u16(buf, OFF_CHECKSUM);
        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN);

        let end = buf.len().min(HEADER_LEN + payload_len as usize);
        let payload = &buf[HEADER_LEN..end];

        let computed = checksum(seq, ack, flags, payload_len, payload);
        if computed != stored {
            return Err(PacketError::ChecksumMismatch { stored, computed });
        }

        Ok(Packet {
            header: Header {
                seq,
                ack,
                flags,
                checksum: stored,
                payload_len,
            },
            payload: payload.to_vec(),
        })
    }
}

/// Errors that can arise when building or parsing a datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Fewer bytes than a header.
    #[error("malformed datagram: {len} bytes is shorter than the {HEADER_LEN}-byte header")]
    Malformed { len: usize },
    /// Checksum did not match the recomputed value.
    #[error("checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },
    /// Payload does not fit in a single datagram.
    #[error("payload of {len} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    PayloadTooLarge { len: usize },
}

/// Human-readable rendering of a flag byte for log lines, e.g. `SYN|ACK`.
///
/// A packet with no flags set is a data segment and renders as `DATA`.
pub fn flag_names(bits: u8) -> String {
    let names: Vec<&str> = [(flags::SYN, "SYN"), (flags::ACK, "ACK"), (flags::FIN, "FIN")]
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "DATA".to_string()
    } else {
        names.join("|")
    }
}

/// Truncated CRC-32 over the checksummed header fields and the payload.
fn checksum(seq: u32, ack: u32, flags: u8, payload_len: u16, payload: &[u8]) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_be_bytes());
    hasher.update(&ack.to_be_bytes());
    hasher.update(&[flags]);
    hasher.update(&payload_len.to_be_bytes());
    hasher.update(payload);
    (hasher.finalize() & 0xffff) as u16
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}
