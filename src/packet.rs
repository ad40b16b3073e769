//! The packet envelope exchanged between tunnels and its wire codec.
//!
//! The wire header is a compact 15 bytes, all fields big-endian:
//!
//! ```text
//! | seq i32 | ack i32 | window u32 | flag u8 | length u16 | content... |
//! ```
//!
//! The window is carried as a full 32-bit value so advertised receive
//! buffers larger than 64 KiB survive the trip. A selective-acknowledgement
//! packet carries, as its content, the ascending big-endian sequence
//! numbers of the segments the receiver is holding out of order.

use std::fmt;
use std::ops::BitOr;
use std::time::Instant;

use thiserror::Error as ThisError;

/// Length of the fixed packet header on the wire.
pub const HEADER_LEN: usize = 15;

/// Control bits carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u8);

impl Flags {
    /// Synchronize sequence numbers
    pub const SYN: Flags = Flags(0x01);
    /// Acknowledgment field significant
    pub const ACK: Flags = Flags(0x02);
    /// No more data from sender
    pub const FIN: Flags = Flags(0x04);
    /// Reset the connection
    pub const RST: Flags = Flags(0x08);
    /// Content lists selectively acknowledged sequence numbers
    pub const SACK: Flags = Flags(0x10);

    pub fn empty() -> Self {
        Flags(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn syn(self) -> bool {
        self.0 & Self::SYN.0 != 0
    }

    pub fn ack(self) -> bool {
        self.0 & Self::ACK.0 != 0
    }

    pub fn fin(self) -> bool {
        self.0 & Self::FIN.0 != 0
    }

    pub fn rst(self) -> bool {
        self.0 & Self::RST.0 != 0
    }

    pub fn sack(self) -> bool {
        self.0 & Self::SACK.0 != 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl From<u8> for Flags {
    fn from(bits: u8) -> Self {
        Flags(bits)
    }
}

impl From<Flags> for u8 {
    fn from(flags: Flags) -> Self {
        flags.0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
            (Self::SACK, "SACK"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit.0 != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Errors produced while decoding a packet off the wire.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("The packet header is incomplete")]
    HeaderTooShort,
    #[error("Expected {expected} content bytes but got {actual}")]
    TruncatedContent { expected: usize, actual: usize },
    #[error("Selective ack payload of {0} bytes is not a whole number of ids")]
    MalformedSack(usize),
}

/// A single tunnel packet.
///
/// Packets are pool-allocated ([`crate::pool::PacketPool`]); ownership
/// moves into a tunnel on receive and recycling is explicit. `t` records
/// when the packet was first transmitted and is only meaningful while the
/// packet sits in a send buffer awaiting acknowledgment.
#[derive(Clone)]
pub struct Packet {
    pub seq: i32,
    pub ack: i32,
    pub flag: Flags,
    pub window: u32,
    pub content: Vec<u8>,
    pub t: Instant,
}

impl Packet {
    pub fn empty() -> Self {
        Self {
            seq: 0,
            ack: 0,
            flag: Flags::empty(),
            window: 0,
            content: Vec::new(),
            t: Instant::now(),
        }
    }

    /// Clears every field so no state leaks into the next use of this
    /// envelope. The content allocation is kept.
    pub fn reset(&mut self) {
        self.seq = 0;
        self.ack = 0;
        self.flag = Flags::empty();
        self.window = 0;
        self.content.clear();
        self.t = Instant::now();
    }

    /// How many sequence units this packet occupies: its payload length if
    /// it carries data, one unit for a SYN or FIN control, zero otherwise.
    pub fn units(&self) -> i32 {
        if !self.content.is_empty() {
            self.content.len() as i32
        } else if self.flag.syn() || self.flag.fin() {
            1
        } else {
            0
        }
    }

    /// Serializes the packet for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.content.len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.extend_from_slice(&self.window.to_be_bytes());
        out.push(self.flag.into());
        out.extend_from_slice(&(self.content.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.content);
        out
    }

    /// Parses a packet from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut packet = Packet::empty();
        packet.decode_into(bytes)?;
        Ok(packet)
    }

    /// Parses a packet from the wire into an existing envelope, typically
    /// one just acquired from the pool.
    pub fn decode_into(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        let mut bytes = bytes.iter().copied();
        let mut next = || -> Result<u8, PacketError> {
            bytes.next().ok_or(PacketError::HeaderTooShort)
        };

        let seq = i32::from_be_bytes([next()?, next()?, next()?, next()?]);
        let ack = i32::from_be_bytes([next()?, next()?, next()?, next()?]);
        let window = u32::from_be_bytes([next()?, next()?, next()?, next()?]);
        let flag = Flags::from(next()?);
        let length = u16::from_be_bytes([next()?, next()?]) as usize;

        self.content.clear();
        self.content.extend(bytes);
        if self.content.len() != length {
            let actual = self.content.len();
            self.content.clear();
            return Err(PacketError::TruncatedContent {
                expected: length,
                actual,
            });
        }

        self.seq = seq;
        self.ack = ack;
        self.window = window;
        self.flag = flag;
        Ok(())
    }

    /// The selectively acknowledged sequence numbers carried by a SACK
    /// packet, in the order the peer wrote them (ascending).
    pub fn sack_ids(&self) -> Result<Vec<i32>, PacketError> {
        if self.content.len() % 4 != 0 {
            return Err(PacketError::MalformedSack(self.content.len()));
        }
        Ok(self
            .content
            .chunks_exact(4)
            .map(|id| i32::from_be_bytes([id[0], id[1], id[2], id[3]]))
            .collect())
    }

    /// Replaces the content with an encoded selective-ack id list.
    pub fn set_sack_ids(&mut self, ids: &[i32]) {
        self.content.clear();
        self.content.reserve(ids.len() * 4);
        for id in ids {
            self.content.extend_from_slice(&id.to_be_bytes());
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet {{ seq: {}, ack: {}, flag: {}, window: {}, len: {} }}",
            self.seq,
            self.ack,
            self.flag,
            self.window,
            self.content.len()
        )
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        // The transmit timestamp is bookkeeping, not identity.
        self.seq == other.seq
            && self.ack == other.ack
            && self.flag == other.flag
            && self.window == other.window
            && self.content == other.content
    }
}

impl Eq for Packet {}
