//! Packet types (§3 Data Model).
//!
//! PuTTY's `PktIn`/`PktOut` are intrusive queue nodes with a raw
//! `BinarySource`/`BinarySink` pair bolted on. Here the queue is a plain
//! `VecDeque` (see `queue.rs`) owning its packets by value, so there is no
//! intrusive node to model — `formal_size` survives as a field used for the
//! queue-accounting invariant in §8, and the packet body is an owned
//! `CryptoVec` rather than a borrowed slice across the pop, which is the
//! `Vec`-backed model §9's design notes recommend in place of raw pointer
//! aliasing.

use cryptovec::CryptoVec;

use crate::reader::PacketCursor;

/// A fully received, decrypted packet handed up from the BPP.
#[derive(Debug)]
pub struct PktIn {
    pub msg_type: u8,
    pub seqn: u32,
    pub body: CryptoVec,
}

impl PktIn {
    pub fn new(msg_type: u8, seqn: u32, body: CryptoVec) -> Self {
        PktIn { msg_type, seqn, body }
    }

    /// A cursor over the packet body, positioned at the first byte after the
    /// message type (the type byte itself is not part of `body`).
    pub fn reader(&self) -> PacketCursor<'_> {
        PacketCursor::new(&self.body)
    }

    /// Bytes charged against a `PktInQueue`'s `total_size` (§4.1, §8).
    pub fn formal_size(&self) -> usize {
        self.body.len() + 1
    }
}

/// A packet under construction for transmission.
#[derive(Debug)]
pub struct PktOut {
    pub msg_type: u8,
    pub body: CryptoVec,
}

impl PktOut {
    pub fn new(msg_type: u8) -> Self {
        PktOut {
            msg_type,
            body: CryptoVec::new(),
        }
    }

    pub fn formal_size(&self) -> usize {
        self.body.len() + 1
    }
}
