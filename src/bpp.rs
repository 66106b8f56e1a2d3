//! Binary Packet Protocol hook abstraction (§4.2). Grounded on
//! `ssh2connection.c`'s `PacketProtocolLayer` vtable fields used by the
//! connection layer (`new_pktout`, the in/out queues, `got_user_input`,
//! `queue_idempotent_callback`) and on `thrussh::sshbuffer`'s separation of
//! "already-decrypted packet" from "bytes still being assembled" — the BPP
//! itself (key exchange, cipher/MAC, sequence numbering) sits below this
//! hook and out of scope (§1 Non-goals); this module is only the seam the
//! connection layer sees.

use std::sync::Arc;

use cryptovec::CryptoVec;
use tokio::sync::Notify;

use crate::msg;
use crate::packet::{PktIn, PktOut};
use crate::queue::PacketQueue;
use crate::reader::PacketWriter;

/// The BPP-facing handle the connection layer is given (§4.2). Owns the
/// in/out packet queues and the two idempotent callbacks: one the cipher
/// layer fires when decrypted bytes land in `inq`, one the connection layer
/// fires when it pushes onto `outq`.
pub struct BppHooks {
    pub inq: PacketQueue<PktIn>,
    pub outq: PacketQueue<PktOut>,
    /// Fired by the layer below when `inq` gains packets.
    pub on_incoming: Arc<Notify>,
    /// Fired by the connection layer when it pushes onto `outq`, for
    /// whatever owns writing `outq` out to the wire to wake up.
    pub on_outgoing: Arc<Notify>,
    next_in_seqn: u32,
    /// Message types the local side declares willingness to receive, used
    /// by `check_unimplemented` (§4.2).
    recognized_types: Vec<u8>,
}

impl BppHooks {
    pub fn new(recognized_types: Vec<u8>) -> Self {
        let on_incoming = Arc::new(Notify::new());
        let on_outgoing = Arc::new(Notify::new());
        BppHooks {
            inq: PacketQueue::with_notify(on_incoming.clone()),
            outq: PacketQueue::with_notify(on_outgoing.clone()),
            on_incoming,
            on_outgoing,
            next_in_seqn: 0,
            recognized_types,
        }
    }

    /// `new_pktout(type)` (§4.2): a fresh, empty outbound packet.
    pub fn new_pktout(&self, msg_type: u8) -> PktOut {
        PktOut::new(msg_type)
    }

    /// Feed a freshly decrypted packet in from below (what a real BPP's
    /// dispatcher would call once key exchange/cipher/MAC processing is
    /// done; stands in for that layer per §1's Non-goals).
    pub fn deliver(&mut self, msg_type: u8, body: CryptoVec) {
        let seqn = self.next_in_seqn;
        self.next_in_seqn = self.next_in_seqn.wrapping_add(1);
        self.inq.push(PktIn::new(msg_type, seqn, body));
    }

    /// `check_unimplemented(pkt)` (§4.2): if `pkt`'s type is not among the
    /// recognized set, enqueue `SSH_MSG_UNIMPLEMENTED` carrying its sequence
    /// number and report `true` so the caller drops the packet.
    pub fn check_unimplemented(&mut self, pkt: &PktIn) -> bool {
        if self.recognized_types.contains(&pkt.msg_type) {
            return false;
        }
        let mut reply = PktOut::new(msg::UNIMPLEMENTED);
        reply.body.put_u32(pkt.seqn);
        self.outq.push(reply);
        true
    }

    /// `queue_disconnect(msg, category)` (§4.2): enqueue `SSH_MSG_DISCONNECT`
    /// on a fatal error.
    pub fn queue_disconnect(&mut self, reason_code: u32, message: &str) {
        let mut pkt = PktOut::new(msg::DISCONNECT);
        pkt.body.put_u32(reason_code);
        pkt.body.put_string(message.as_bytes());
        pkt.body.put_string(b"");
        self.outq.push(pkt);
    }
}

/// The set of message types the connection layer recognizes and is willing
/// to receive (§4.2's `check_unimplemented`); anything else gets
/// `SSH_MSG_UNIMPLEMENTED`.
pub fn recognized_connection_layer_types() -> Vec<u8> {
    vec![
        msg::GLOBAL_REQUEST,
        msg::REQUEST_SUCCESS,
        msg::REQUEST_FAILURE,
        msg::CHANNEL_OPEN,
        msg::CHANNEL_OPEN_CONFIRMATION,
        msg::CHANNEL_OPEN_FAILURE,
        msg::CHANNEL_WINDOW_ADJUST,
        msg::CHANNEL_DATA,
        msg::CHANNEL_EXTENDED_DATA,
        msg::CHANNEL_EOF,
        msg::CHANNEL_CLOSE,
        msg::CHANNEL_REQUEST,
        msg::CHANNEL_SUCCESS,
        msg::CHANNEL_FAILURE,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unimplemented_enqueued_for_unrecognized_type() {
        let mut hooks = BppHooks::new(recognized_connection_layer_types());
        let pkt = PktIn::new(250, 42, CryptoVec::new());
        assert!(hooks.check_unimplemented(&pkt));
        assert_eq!(hooks.outq.len(), 1);
    }

    #[test]
    fn recognized_type_is_not_flagged() {
        let mut hooks = BppHooks::new(recognized_connection_layer_types());
        let pkt = PktIn::new(msg::CHANNEL_DATA, 1, CryptoVec::new());
        assert!(!hooks.check_unimplemented(&pkt));
        assert!(hooks.outq.is_empty());
    }
}
