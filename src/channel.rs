//! Channel state machine (§3 Data Model, §4.4). Grounded on `ssh2connection.c`'s
//! `struct ssh2_channel` and its `ssh2_channel_*` functions, and on
//! `thrussh::Channel`/`ChannelMsg` in `thrussh/src/lib.rs` for the Rust-side
//! shape (a plain struct of scalar fields plus a polymorphic sink, rather than
//! an intrusive `vt`-pointer struct).

use std::collections::VecDeque;

use bitflags::bitflags;
use cryptovec::CryptoVec;
use tracing::{debug, trace, warn};

use crate::msg;
use crate::packet::PktIn;
use crate::queue::PacketQueue;
use crate::reader::PacketWriter;

pub const DEFAULT_WIN: u32 = 0x20000;
pub const BIG_WIN: u32 = 0x4000_0000;

bitflags! {
    /// `closes` bitmap (§3).
    pub struct CloseFlags: u8 {
        const SENT_EOF   = 0b0001;
        const SENT_CLOSE = 0b0010;
        const RCVD_EOF   = 0b0100;
        const RCVD_CLOSE = 0b1000;
    }
}

/// Per-channel throttle state machine (§4.4 "Throttling").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleState {
    Throttled,
    Unthrottling,
    Unthrottled,
}

/// `SSH_MSG_CHANNEL_OPEN_FAILURE` reason codes, with the English strings
/// `ssh2connection.c`'s reason-code table attaches to each (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailureReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    Other(u32),
}

impl OpenFailureReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => OpenFailureReason::AdministrativelyProhibited,
            2 => OpenFailureReason::ConnectFailed,
            3 => OpenFailureReason::UnknownChannelType,
            4 => OpenFailureReason::ResourceShortage,
            other => OpenFailureReason::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            OpenFailureReason::AdministrativelyProhibited => 1,
            OpenFailureReason::ConnectFailed => 2,
            OpenFailureReason::UnknownChannelType => 3,
            OpenFailureReason::ResourceShortage => 4,
            OpenFailureReason::Other(code) => *code,
        }
    }

    pub fn message(&self) -> String {
        match self {
            OpenFailureReason::AdministrativelyProhibited => "Administratively prohibited".into(),
            OpenFailureReason::ConnectFailed => "Connect failed".into(),
            OpenFailureReason::UnknownChannelType => "Unknown channel type".into(),
            OpenFailureReason::ResourceShortage => "Resource shortage".into(),
            OpenFailureReason::Other(code) => format!("unknown reason code {}", code),
        }
    }
}

/// What to do when a reply arrives for an outstanding per-channel request.
/// A small closed enum rather than a boxed closure or trait object: the
/// response shapes the connection layer actually needs are enumerable (see
/// SPEC_FULL.md §10.6), matching `thrussh`'s preference for enums like
/// `ChannelMsg` over `dyn Fn` at similarly small, fixed call sites.
#[derive(Debug, Clone)]
pub enum ChannelRequestHandler {
    /// The `winadj@putty.projects.tartarus.org` forced-ack request: any
    /// reply, success or failure, means the peer has seen our window
    /// enlargement. Carries the size of that enlargement so the ack handler
    /// can restore `remote_local_window` by the right amount.
    WinAdjAck(u32),
    /// A step in the main channel's post-open request chain.
    MainchanStep(crate::mainchan::MainchanRequestKind),
    /// No-op: used for requests whose reply carries no useful information.
    Discard,
}

/// An outstanding channel request awaiting its `SUCCESS`/`FAILURE` reply.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub handler: ChannelRequestHandler,
}

/// An unbounded FIFO of outbound bytes (§ Glossary "Bufchain").
#[derive(Debug, Default)]
pub struct Bufchain {
    bytes: VecDeque<u8>,
}

impl Bufchain {
    pub fn new() -> Self {
        Bufchain { bytes: VecDeque::new() }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.bytes.extend(data.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Remove and return up to `max` bytes from the front.
    pub fn consume(&mut self, max: usize) -> Vec<u8> {
        let n = self.bytes.len().min(max);
        self.bytes.drain(..n).collect()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Context handed to a [`ChannelSink`] when it needs to act on the channel
/// that owns it (enqueue further requests, push packets) from inside a
/// callback. Plain disjoint-borrow struct rather than passing `&mut
/// ChannelState` itself, since the sink lives inside `ChannelState::target`
/// and can't simultaneously hold `&mut self`.
pub struct ChanCtx<'a> {
    pub remote_id: u32,
    pub out: &'a mut PacketQueue<crate::packet::PktOut>,
    pub requests: &'a mut VecDeque<ChannelRequest>,
}

impl<'a> ChanCtx<'a> {
    /// Push a `CHANNEL_REQUEST` and record its handler on the outstanding FIFO.
    pub fn send_request(&mut self, name: &str, want_reply: bool, extra: impl FnOnce(&mut CryptoVec), handler: ChannelRequestHandler) {
        let mut pkt = crate::packet::PktOut::new(msg::CHANNEL_REQUEST);
        pkt.body.put_u32(self.remote_id);
        pkt.body.put_string(name.as_bytes());
        pkt.body.put_bool(want_reply);
        extra(&mut pkt.body);
        self.out.push(pkt);
        if want_reply {
            self.requests.push_back(ChannelRequest { handler });
        }
    }
}

/// The polymorphic "client" attached to a channel (§3: `Channel` field).
/// Corresponds to `ssh2connection.c`'s `ChannelVtable`; mapped onto a trait
/// per §9's design note rather than a function-pointer struct. All methods
/// have inert defaults so a sink only needs to override what it cares about.
pub trait ChannelSink {
    fn open_confirmation(&mut self, _ctx: &mut ChanCtx<'_>) {}
    fn open_failed(&mut self, _msg: &str) {}
    /// Sink received `count` bytes (stderr or not); returns this sink's own
    /// outstanding buffered-but-not-yet-consumed byte count, used for the
    /// adaptive window growth and throttling decisions in §4.4.
    fn send(&mut self, _is_stderr: bool, data: &[u8]) -> usize {
        data.len();
        0
    }
    fn send_eof(&mut self) {}
    fn rcvd_exit_status(&mut self, _status: u32) {}
    fn rcvd_exit_signal(&mut self, _name: &str, _core_dumped: bool, _message: &str) {}
    fn rcvd_exit_signal_numeric(&mut self, _signum: u32, _core_dumped: bool, _message: &str) {}
    /// Whether the channel should initiate `CLOSE` even though both EOF
    /// directions haven't completed (e.g. the local process died).
    fn want_close(&self, _sent_eof: bool, _rcvd_eof: bool) -> bool {
        false
    }
    fn log_close_msg(&self) -> Option<String> {
        None
    }
    fn initial_fixed_window_size(&self) -> Option<u32> {
        None
    }
    fn set_input_wanted(&mut self, _wanted: bool) {}
    /// A reply arrived for a request this sink chained via [`ChanCtx::send_request`].
    fn on_request_reply(&mut self, _ctx: &mut ChanCtx<'_>, _kind: &crate::mainchan::MainchanRequestKind, _success: bool) {}
    /// The local terminal size changed (§4.5: deliver immediately if ready,
    /// otherwise remember it for delivery once the channel becomes ready).
    fn note_resize(&mut self, _ctx: &mut ChanCtx<'_>, _width: u32, _height: u32) {}
    /// The user asked to send a `"signal"` channel request (RFC 4254 §6.9).
    fn user_signal(&mut self, _ctx: &mut ChanCtx<'_>, _name: &str) {}
    /// The user asked to send a `"break"` channel request (RFC 4254 §6.8).
    fn user_break(&mut self, _ctx: &mut ChanCtx<'_>, _break_length_ms: u32) {}
}

/// A downstream connection-sharing target (§3 Channel: `SharingContext`).
/// Per-channel packets for a shared channel bypass this crate's own per-type
/// parsing entirely and are forwarded to it verbatim (§4.3: "if it has a
/// sharing context, forward the raw packet").
pub trait SharingHandle: Send {
    fn forward_raw(&mut self, pkt: &PktIn);
}

/// Where a channel's received packets go: either parsed and handed to a
/// [`ChannelSink`], or bypassed whole to a [`SharingHandle`] (§3 "Channel":
/// "exactly one of `sharectx` and `chan` is non-null"). An enum rather than
/// two optional fields makes that exclusivity a property of the type instead
/// of an invariant callers have to maintain by hand.
pub enum ChanTarget {
    Sink(Box<dyn ChannelSink + Send>),
    Sharing(Box<dyn SharingHandle>),
}

impl ChanTarget {
    pub fn is_sharing(&self) -> bool {
        matches!(self, ChanTarget::Sharing(_))
    }

    /// Forward a raw packet to the sharing downstream (§4.3). Dispatch must
    /// check [`is_sharing`](Self::is_sharing) before any other per-message
    /// handling reaches the channel; calling this on a `Sink` is a bug.
    pub fn forward_raw(&mut self, pkt: &PktIn) {
        match self {
            ChanTarget::Sharing(handle) => handle.forward_raw(pkt),
            ChanTarget::Sink(_) => debug_assert!(false, "forward_raw called on a non-sharing channel"),
        }
    }

    /// Precondition: not sharing (dispatch routes sharing channels to
    /// `forward_raw` before any per-type handler runs).
    fn sink_mut(&mut self) -> &mut (dyn ChannelSink + Send) {
        match self {
            ChanTarget::Sink(sink) => sink.as_mut(),
            ChanTarget::Sharing(_) => panic!("per-message dispatch reached a channel with a sharing context"),
        }
    }
}

/// A channel's full record (§3 "Channel"). `half_open` true implies no data
/// has ever been sent on it; `closes & SENT_CLOSE` implies further outbound
/// requests are suppressed.
pub struct ChannelState {
    pub local_id: u32,
    pub remote_id: u32,
    pub channel_type: String,
    pub half_open: bool,
    pub closes: CloseFlags,
    pub pending_eof: bool,
    pub throttling_conn: bool,
    pub throttled_by_backlog: bool,
    pub outgoing: Bufchain,
    pub remote_window: u64,
    pub remote_maxpkt: u32,
    pub local_window: i64,
    pub local_maxwin: u32,
    pub remote_local_window: i64,
    pub requests: VecDeque<ChannelRequest>,
    pub throttle_state: ThrottleState,
    pub target: ChanTarget,
}

impl ChannelState {
    /// Construct a channel we are opening outbound: `half_open = true`,
    /// caller still needs to push the `CHANNEL_OPEN` packet `chanopen_init`
    /// returns (§4.4 "Open (outbound)").
    pub fn new_outbound(local_id: u32, channel_type: impl Into<String>, local_window: u32, sink: Box<dyn ChannelSink + Send>) -> Self {
        ChannelState {
            local_id,
            remote_id: 0,
            channel_type: channel_type.into(),
            half_open: true,
            closes: CloseFlags::empty(),
            pending_eof: false,
            throttling_conn: false,
            throttled_by_backlog: false,
            outgoing: Bufchain::new(),
            remote_window: 0,
            remote_maxpkt: 0,
            local_window: local_window as i64,
            local_maxwin: local_window,
            remote_local_window: local_window as i64,
            requests: VecDeque::new(),
            throttle_state: ThrottleState::Unthrottled,
            target: ChanTarget::Sink(sink),
        }
    }

    /// Construct a channel in response to a peer `CHANNEL_OPEN`:
    /// `half_open = false` because we reply synchronously (§3 Lifecycles).
    /// `target` is `ChanTarget::Sharing` when the inbound handler elected to
    /// bypass this channel to a downstream connection-sharing client
    /// instead of handling it locally (§3, §4.3).
    pub fn new_inbound(
        local_id: u32,
        remote_id: u32,
        channel_type: impl Into<String>,
        local_window: u32,
        remote_window: u32,
        remote_maxpkt: u32,
        target: ChanTarget,
    ) -> Self {
        ChannelState {
            local_id,
            remote_id,
            channel_type: channel_type.into(),
            half_open: false,
            closes: CloseFlags::empty(),
            pending_eof: false,
            throttling_conn: false,
            throttled_by_backlog: false,
            outgoing: Bufchain::new(),
            remote_window: remote_window as u64,
            remote_maxpkt,
            local_window: local_window as i64,
            local_maxwin: local_window,
            remote_local_window: local_window as i64,
            requests: VecDeque::new(),
            throttle_state: ThrottleState::Unthrottled,
            target,
        }
    }

    /// `chanopen_init`: a `CHANNEL_OPEN` prefilled with
    /// `(type, local_id, local_window, our_maxpkt)`. The caller appends
    /// type-specific fields before pushing it.
    pub fn chanopen_init(channel_type: &str, local_id: u32, local_window: u32, our_maxpkt: u32) -> crate::packet::PktOut {
        let mut pkt = crate::packet::PktOut::new(msg::CHANNEL_OPEN);
        pkt.body.put_string(channel_type.as_bytes());
        pkt.body.put_u32(local_id);
        pkt.body.put_u32(local_window);
        pkt.body.put_u32(our_maxpkt);
        pkt
    }

    pub fn open_confirmation(&mut self, remote_id: u32, remote_window: u32, remote_maxpkt: u32, out: &mut PacketQueue<crate::packet::PktOut>) {
        debug_assert!(self.half_open, "OPEN_CONFIRMATION on a channel that isn't half-open");
        self.remote_id = remote_id;
        self.half_open = false;
        self.remote_window = remote_window as u64;
        self.remote_maxpkt = remote_maxpkt;
        let ChannelState { ref mut target, ref mut requests, .. } = self;
        let mut ctx = ChanCtx { remote_id, out, requests };
        target.sink_mut().open_confirmation(&mut ctx);
        self.check_close(out);
        if self.pending_eof {
            self.try_eof(out);
        }
    }

    /// SUCCESS / FAILURE for a channel request (§4.4): pop the FIFO head,
    /// dispatch by handler kind, then re-check whether the channel can close.
    pub fn handle_request_reply(&mut self, success: bool, out: &mut PacketQueue<crate::packet::PktOut>) -> Result<(), crate::error::ConnError> {
        let request = self
            .requests
            .pop_front()
            .ok_or_else(|| crate::error::ConnError::protocol("CHANNEL_SUCCESS/FAILURE with no outstanding request"))?;
        match request.handler {
            ChannelRequestHandler::WinAdjAck(size) => self.handle_winadj_ack(size),
            ChannelRequestHandler::Discard => {}
            ChannelRequestHandler::MainchanStep(kind) => {
                let remote_id = self.remote_id;
                let ChannelState { ref mut target, ref mut requests, .. } = self;
                let mut ctx = ChanCtx { remote_id, out, requests };
                target.sink_mut().on_request_reply(&mut ctx, &kind, success);
            }
        }
        self.check_close(out);
        Ok(())
    }

    pub fn open_failure(&mut self, reason: OpenFailureReason, message: &str) {
        debug_assert!(self.half_open, "OPEN_FAILURE on a channel that isn't half-open");
        warn!(local_id = self.local_id, ?reason, message, "channel open failed");
        self.target.sink_mut().open_failed(message);
    }

    /// DATA / EXTENDED_DATA (§4.4). `extended_type` is `0` for plain DATA.
    /// Returns the outbound `WINDOW_ADJUST`/`winadj` packets to push, via
    /// `out`. `peer_ignores_maxpkt` and `simple_mode` come from connection
    /// config/quirks (§10.1's `ConnectionConfig`, §6's quirk note).
    pub fn handle_data(
        &mut self,
        extended_type: u32,
        mut data: &[u8],
        peer_ignores_maxpkt: bool,
        simple_mode: bool,
        out: &mut PacketQueue<crate::packet::PktOut>,
    ) -> bool {
        let is_stderr = extended_type == msg::EXTENDED_DATA_STDERR;
        let len = data.len() as i64;
        if extended_type != 0 && !is_stderr {
            // Debit the window for the bytes received but discard the
            // payload (§9 open question: preserved as a known deviation,
            // not necessarily RFC-mandated).
            data = &[];
        }
        self.local_window -= len;
        self.remote_local_window -= len;
        let bufsize = self.target.sink_mut().send(is_stderr, data);
        trace!(local_id = self.local_id, len, local_window = self.local_window, "channel data debited window");

        if self.remote_local_window <= 0 && self.throttle_state == ThrottleState::Unthrottled && self.local_maxwin < BIG_WIN {
            self.local_maxwin += DEFAULT_WIN;
        }

        if (bufsize as u32) < self.local_maxwin {
            self.set_window(self.local_maxwin - bufsize as u32, peer_ignores_maxpkt, out);
        }

        let mut request_conn_throttle = false;
        if (bufsize as u32 > self.local_maxwin || (simple_mode && bufsize > 0)) && !self.throttling_conn {
            self.throttling_conn = true;
            request_conn_throttle = true;
        }
        request_conn_throttle
    }

    /// `set_window(newwin)` (§4.4).
    pub fn set_window(&mut self, mut newwin: u32, peer_ignores_maxpkt: bool, out: &mut PacketQueue<crate::packet::PktOut>) {
        if self.closes.intersects(CloseFlags::RCVD_EOF | CloseFlags::SENT_CLOSE) {
            return;
        }
        if self.target.sink_mut().initial_fixed_window_size().is_some() {
            return;
        }
        if peer_ignores_maxpkt {
            newwin = newwin.min(crate::connection::OUR_MAXPKT);
        }

        if (newwin as i64) / 2 >= self.local_window {
            let mut pkt = crate::packet::PktOut::new(msg::CHANNEL_WINDOW_ADJUST);
            pkt.body.put_u32(self.remote_id);
            let delta = (newwin as i64 - self.local_window).max(0) as u32;
            pkt.body.put_u32(delta);
            out.push(pkt);

            if newwin >= self.local_maxwin {
                let mut req = crate::packet::PktOut::new(msg::CHANNEL_REQUEST);
                req.body.put_u32(self.remote_id);
                req.body.put_string(b"winadj@putty.projects.tartarus.org");
                req.body.put_bool(true);
                out.push(req);
                self.requests.push_back(ChannelRequest { handler: ChannelRequestHandler::WinAdjAck(delta) });
                self.throttle_state = ThrottleState::Unthrottling;
            } else {
                // No winadj round trip requested; pretend the WINDOW_ADJUST
                // was acked immediately.
                self.remote_local_window = newwin as i64;
                self.throttle_state = ThrottleState::Throttled;
            }
        }
        self.local_window = newwin as i64;
    }

    /// WINDOW_ADJUST (§4.4).
    pub fn handle_window_adjust(&mut self, delta: u32) {
        if !self.closes.contains(CloseFlags::SENT_EOF) {
            self.remote_window += delta as u64;
        }
    }

    /// Handle the ack for a `winadj@putty.projects.tartarus.org` request:
    /// any reply (success or failure) means the peer has seen our window
    /// enlargement (§9 open question, §10.6). Restores `remote_local_window`
    /// by the enlargement size the request was sent with.
    pub fn handle_winadj_ack(&mut self, size: u32) {
        self.remote_local_window += size as i64;
        if self.throttle_state == ThrottleState::Unthrottling {
            self.throttle_state = ThrottleState::Unthrottled;
        }
    }

    /// EOF (§4.4).
    pub fn handle_eof(&mut self, out: &mut PacketQueue<crate::packet::PktOut>) {
        if !self.closes.contains(CloseFlags::RCVD_EOF) {
            self.closes.insert(CloseFlags::RCVD_EOF);
            self.target.sink_mut().send_eof();
            self.check_close(out);
        }
    }

    /// CLOSE (§4.4). Returns the requests that were abandoned (invoked with
    /// "no reply will ever arrive") so the caller can free their contexts.
    pub fn handle_close(&mut self, out: &mut PacketQueue<crate::packet::PktOut>) -> Vec<ChannelRequest> {
        if !self.closes.contains(CloseFlags::RCVD_EOF) {
            self.closes.insert(CloseFlags::RCVD_EOF);
            self.target.sink_mut().send_eof();
        }
        let abandoned: Vec<ChannelRequest> = self.requests.drain(..).collect();
        self.outgoing.clear();
        if !self.closes.contains(CloseFlags::SENT_EOF) {
            self.pending_eof = true;
            self.try_eof(out);
        }
        self.closes.insert(CloseFlags::RCVD_CLOSE);
        self.check_close(out);
        abandoned
    }

    /// `check_close()` (§4.4). Returns `true` if the channel should now be
    /// destroyed (both `SENT_CLOSE` and `RCVD_CLOSE` set).
    pub fn check_close(&mut self, out: &mut PacketQueue<crate::packet::PktOut>) -> bool {
        if self.half_open {
            return false;
        }
        let both_eof = self.closes.contains(CloseFlags::SENT_EOF) && self.closes.contains(CloseFlags::RCVD_EOF);
        let wants_close = self.target.sink_mut().want_close(self.closes.contains(CloseFlags::SENT_EOF), self.closes.contains(CloseFlags::RCVD_EOF));
        if (both_eof || wants_close) && self.requests.is_empty() && !self.closes.contains(CloseFlags::SENT_CLOSE) {
            let mut pkt = crate::packet::PktOut::new(msg::CHANNEL_CLOSE);
            pkt.body.put_u32(self.remote_id);
            out.push(pkt);
            self.closes.insert(CloseFlags::SENT_EOF | CloseFlags::SENT_CLOSE);
        }
        self.closes.contains(CloseFlags::SENT_CLOSE) && self.closes.contains(CloseFlags::RCVD_CLOSE)
    }

    /// `try_eof()` (§4.4). Precondition: `self.pending_eof`.
    pub fn try_eof(&mut self, out: &mut PacketQueue<crate::packet::PktOut>) {
        if self.half_open || !self.outgoing.is_empty() {
            return;
        }
        self.pending_eof = false;
        let mut pkt = crate::packet::PktOut::new(msg::CHANNEL_EOF);
        pkt.body.put_u32(self.remote_id);
        out.push(pkt);
        self.closes.insert(CloseFlags::SENT_EOF);
        self.check_close(out);
    }

    /// `try_send()` (§4.4). Returns the remaining bufchain size.
    pub fn try_send(&mut self, out: &mut PacketQueue<crate::packet::PktOut>) -> usize {
        while self.remote_window > 0 && !self.outgoing.is_empty() {
            let chunk_len = (self.outgoing.len() as u64).min(self.remote_window).min(self.remote_maxpkt as u64) as usize;
            let chunk = self.outgoing.consume(chunk_len);
            let mut pkt = crate::packet::PktOut::new(msg::CHANNEL_DATA);
            pkt.body.put_u32(self.remote_id);
            pkt.body.put_string(&chunk);
            out.push(pkt);
            self.remote_window -= chunk.len() as u64;
        }
        if self.outgoing.is_empty() && self.pending_eof {
            self.try_eof(out);
        }
        self.outgoing.len()
    }

    /// `try_send_and_unthrottle()`, called after WINDOW_ADJUST (§4.4).
    pub fn try_send_and_unthrottle(&mut self, out: &mut PacketQueue<crate::packet::PktOut>) -> usize {
        self.try_send(out)
    }

    /// Forward a local terminal resize to the sink (§4.5).
    pub fn note_resize(&mut self, width: u32, height: u32, out: &mut PacketQueue<crate::packet::PktOut>) {
        let remote_id = self.remote_id;
        let ChannelState { ref mut target, ref mut requests, .. } = self;
        let mut ctx = ChanCtx { remote_id, out, requests };
        target.sink_mut().note_resize(&mut ctx, width, height);
    }

    /// Forward a user-initiated `"signal"` request to the sink (RFC 4254 §6.9).
    pub fn user_signal(&mut self, name: &str, out: &mut PacketQueue<crate::packet::PktOut>) {
        let remote_id = self.remote_id;
        let ChannelState { ref mut target, ref mut requests, .. } = self;
        let mut ctx = ChanCtx { remote_id, out, requests };
        target.sink_mut().user_signal(&mut ctx, name);
    }

    /// Forward a user-initiated `"break"` request to the sink (RFC 4254 §6.8).
    pub fn user_break(&mut self, break_length_ms: u32, out: &mut PacketQueue<crate::packet::PktOut>) {
        let remote_id = self.remote_id;
        let ChannelState { ref mut target, ref mut requests, .. } = self;
        let mut ctx = ChanCtx { remote_id, out, requests };
        target.sink_mut().user_break(&mut ctx, break_length_ms);
    }

    /// Queue outbound data on this channel's bufchain and attempt to flush
    /// it immediately against the current remote window.
    pub fn queue_data(&mut self, data: &[u8], out: &mut PacketQueue<crate::packet::PktOut>) {
        self.outgoing.push(data);
        self.try_send(out);
    }

    /// `check_throttle()` (§4.4): the input-wanted flag the sink should
    /// reflect in its own flow control.
    pub fn check_throttle(&mut self, all_channels_throttled: bool) {
        let wanted = !self.throttled_by_backlog
            && !all_channels_throttled
            && !self.pending_eof
            && !self.closes.contains(CloseFlags::SENT_EOF);
        self.target.sink_mut().set_input_wanted(wanted);
    }

    /// `unthrottle(bufsize)` (§4.4). Returns `true` if the connection-wide
    /// throttle refcount should be released.
    pub fn unthrottle(&mut self, bufsize: usize, simple_mode: bool, peer_ignores_maxpkt: bool, out: &mut PacketQueue<crate::packet::PktOut>) -> bool {
        let buflimit = if simple_mode { 0 } else { self.local_maxwin };
        if (bufsize as u32) < buflimit {
            self.set_window(buflimit - bufsize as u32, peer_ignores_maxpkt, out);
        }
        if self.throttling_conn && (bufsize as u32) < buflimit {
            self.throttling_conn = false;
            return true;
        }
        false
    }

    /// Parse and dispatch `CHANNEL_REQUEST`'s known types (§4.4). Returns
    /// `Some(true/false)` if a reply should be sent (success/failure),
    /// `None` if `want_reply` was false.
    pub fn handle_request(&mut self, pkt: &PktIn) -> Result<Option<bool>, crate::error::ConnError> {
        let mut cur = pkt.reader();
        let req_type = cur.read_utf8_string()?;
        let mut want_reply = cur.read_bool()?;
        if self.closes.contains(CloseFlags::SENT_CLOSE) {
            want_reply = false;
        }

        let handled = match req_type.as_str() {
            "exit-status" => {
                let status = cur.read_u32()?;
                self.target.sink_mut().rcvd_exit_status(status);
                true
            }
            "exit-signal" => {
                self.handle_exit_signal(&mut cur)?;
                true
            }
            _ => {
                debug!(local_id = self.local_id, req_type = %req_type, "unrecognized channel request");
                false
            }
        };

        if want_reply {
            Ok(Some(handled))
        } else {
            Ok(None)
        }
    }

    /// `exit-signal` dual-format parse (§4.4, §8 scenario 4): standard
    /// (string signal name) first, rewinding and retrying as the legacy
    /// OpenSSH < 3.4p1 numeric form on parse failure.
    fn handle_exit_signal(&mut self, cur: &mut crate::reader::PacketCursor<'_>) -> Result<(), crate::error::ConnError> {
        let save = cur.position;
        let standard = (|| -> Result<(String, bool, String), crate::error::ConnError> {
            let name = cur.read_utf8_string()?;
            let core_dumped = cur.read_bool()?;
            let message = cur.read_utf8_string()?;
            Ok((name, core_dumped, message))
        })();

        match standard {
            Ok((name, core_dumped, message)) => {
                self.target.sink_mut().rcvd_exit_signal(&name, core_dumped, &message);
            }
            Err(_) => {
                cur.position = save;
                let signum = cur.read_u32()?;
                let core_dumped = cur.read_bool()?;
                let message = cur.read_utf8_string()?;
                let _lang_tag = cur.read_utf8_string().unwrap_or_default();
                self.target.sink_mut().rcvd_exit_signal_numeric(signum, core_dumped, &message);
            }
        }
        Ok(())
    }
}

/// `128 + signum`, or `128` for an unmapped signal name (§4.5).
pub fn exit_code_for_signal(signum: Option<u32>) -> u32 {
    128 + signum.unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        received: Vec<(bool, Vec<u8>)>,
        exit_status: Option<u32>,
        exit_signal_numeric: Option<(u32, bool, String)>,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink { received: Vec::new(), exit_status: None, exit_signal_numeric: None }
        }
    }

    impl ChannelSink for RecordingSink {
        fn send(&mut self, is_stderr: bool, data: &[u8]) -> usize {
            self.received.push((is_stderr, data.to_vec()));
            0
        }
        fn rcvd_exit_status(&mut self, status: u32) {
            self.exit_status = Some(status);
        }
        fn rcvd_exit_signal_numeric(&mut self, signum: u32, core_dumped: bool, message: &str) {
            self.exit_signal_numeric = Some((signum, core_dumped, message.to_string()));
        }
    }

    fn make_channel() -> ChannelState {
        let mut ch = ChannelState::new_outbound(256, "session", DEFAULT_WIN, Box::new(RecordingSink::new()));
        let mut out = PacketQueue::new();
        ch.open_confirmation(17, DEFAULT_WIN, 0x8000, &mut out);
        ch
    }

    #[test]
    fn happy_path_data_debits_window() {
        let mut ch = make_channel();
        let mut out = PacketQueue::new();
        let before = ch.local_window;
        ch.handle_data(0, b"foo\nbar\n", false, false, &mut out);
        assert_eq!(ch.local_window, before - 8);
    }

    #[test]
    fn adaptive_window_growth_on_sustained_traffic() {
        let mut ch = make_channel();
        let mut out = PacketQueue::new();
        assert_eq!(ch.local_maxwin, DEFAULT_WIN);
        // Simulate the peer having sent DEFAULT_WIN bytes before any reply:
        // remote_local_window drops to <= 0 while still Unthrottled.
        ch.remote_local_window = 0;
        ch.handle_data(0, b"", false, false, &mut out);
        assert_eq!(ch.local_maxwin, DEFAULT_WIN + DEFAULT_WIN);
    }

    #[test]
    fn winadj_ack_restores_remote_local_window() {
        let mut ch = make_channel();
        let mut out = PacketQueue::new();
        ch.local_window = 0;
        ch.remote_local_window = 0;
        ch.set_window(DEFAULT_WIN, false, &mut out);
        assert_eq!(ch.throttle_state, ThrottleState::Unthrottling);
        assert_eq!(ch.remote_local_window, 0, "remote_local_window stays put until the ack arrives");
        ch.handle_request_reply(true, &mut out).unwrap();
        assert_eq!(ch.throttle_state, ThrottleState::Unthrottled);
        assert_eq!(ch.remote_local_window, DEFAULT_WIN as i64);
    }

    #[test]
    fn set_window_without_winadj_restores_remote_local_window_immediately() {
        let mut ch = make_channel();
        let mut out = PacketQueue::new();
        ch.local_maxwin = DEFAULT_WIN * 4;
        ch.local_window = 0;
        ch.remote_local_window = 0;
        // newwin stays below local_maxwin, so no winadj round trip is requested.
        ch.set_window(DEFAULT_WIN, false, &mut out);
        assert_eq!(ch.throttle_state, ThrottleState::Throttled);
        assert_eq!(ch.remote_local_window, DEFAULT_WIN as i64);
    }

    #[test]
    fn window_adjust_necessity_rule() {
        let mut ch = make_channel();
        let mut out = PacketQueue::new();
        ch.local_window = (DEFAULT_WIN as i64) - 1;
        // newwin/2 < local_window: must NOT send an adjust.
        ch.set_window(10, false, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn exit_signal_numeric_fallback() {
        let mut ch = make_channel();
        let mut body = CryptoVec::new();
        body.put_string(b"exit-signal");
        body.put_bool(false);
        body.put_u32(15);
        body.put_bool(false);
        body.put_string(b"");
        body.put_string(b"");
        let pkt = PktIn::new(msg::CHANNEL_REQUEST, 0, body);
        ch.handle_request(&pkt).unwrap();
        assert_eq!(exit_code_for_signal(Some(15)), 143);
    }

    #[test]
    fn request_fifo_drained_with_null_on_close() {
        let mut ch = make_channel();
        let mut out = PacketQueue::new();
        ch.requests.push_back(ChannelRequest { handler: ChannelRequestHandler::Discard });
        ch.requests.push_back(ChannelRequest { handler: ChannelRequestHandler::Discard });
        let abandoned = ch.handle_close(&mut out);
        assert_eq!(abandoned.len(), 2);
        assert!(ch.requests.is_empty());
    }
}
