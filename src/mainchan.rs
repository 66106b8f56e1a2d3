//! The "main channel" sub-state-machine (§4.5). Grounded on `ssh2connection.c`'s
//! `mainchan_open`/`mainchan_request_response` chain, and on
//! `thrussh::client::Session`/`warpgate-protocol-ssh`'s session-channel request
//! helpers (`request_pty`, `exec`, `shell`) for the Rust-side shape: a
//! [`crate::channel::ChannelSink`] implementation that owns the ordered
//! request chain instead of a hand-rolled coroutine resume point.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::channel::{ChanCtx, ChannelRequestHandler, ChannelSink};
use crate::config::SessionParams;

/// Which mode the main channel operates in (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainchanMode {
    Session,
    DirectTcpip,
}

/// A step in the post-open request chain, used as the payload of
/// [`ChannelRequestHandler::MainchanStep`] so the reply handler knows which
/// step just completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainchanRequestKind {
    X11,
    AuthAgent,
    Pty,
    Env(String),
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadinessState {
    Chaining,
    Ready,
    Failed,
}

/// Terminal size, tracked so a resize between `pty-req` and readiness can be
/// redelivered once the channel is ready (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub width: u32,
    pub height: u32,
}

/// The main channel's sink. Drives the post-open request chain and reports
/// readiness/exit status to whatever owns the connection (a `Notify` plus a
/// shared outcome cell, matching the idempotent-callback idiom used
/// elsewhere rather than a boxed completion closure).
pub struct MainChan {
    mode: MainchanMode,
    params: SessionParams,
    state: ReadinessState,
    pending_env: Vec<(String, String)>,
    requested_size: Option<TermSize>,
    current_size: Option<TermSize>,
    mainchan_eof_pending: bool,
    ready_notify: Arc<Notify>,
    pub exit_code: Option<u32>,
    pub close_message: Option<String>,
    input_wanted: bool,
}

impl MainChan {
    pub fn new(mode: MainchanMode, params: SessionParams, ready_notify: Arc<Notify>) -> Self {
        let pending_env = params.env.clone();
        MainChan {
            mode,
            params,
            state: ReadinessState::Chaining,
            pending_env,
            requested_size: None,
            current_size: None,
            mainchan_eof_pending: false,
            ready_notify,
            exit_code: None,
            close_message: None,
            input_wanted: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReadinessState::Ready
    }

    /// Whether the remote end has sent `CHANNEL_EOF` on the main channel.
    /// §4.5 says readiness "delivers" a deferred EOF; there's no local
    /// stdin/output consumer in this crate's scope to deliver it to, so
    /// delivery here just means the flag becomes reliably queryable once
    /// `is_ready()` is true.
    pub fn remote_eof(&self) -> bool {
        self.mainchan_eof_pending
    }

    fn send_window_change(&mut self, size: TermSize, ctx: &mut ChanCtx<'_>) {
        use crate::reader::PacketWriter;
        ctx.send_request(
            "window-change",
            false,
            move |body| {
                body.put_u32(size.width);
                body.put_u32(size.height);
                body.put_u32(0);
                body.put_u32(0);
            },
            ChannelRequestHandler::Discard,
        );
    }

    fn start_chain(&mut self, ctx: &mut ChanCtx<'_>) {
        if self.mode == MainchanMode::DirectTcpip {
            self.mark_ready(ctx);
            return;
        }

        if self.params.x11_forwarding {
            ctx.send_request(
                "x11-req",
                true,
                |body| {
                    use crate::reader::PacketWriter;
                    body.put_bool(false); // single connection
                    body.put_string(b"MIT-MAGIC-COOKIE-1");
                    body.put_string(b"");
                    body.put_u32(0);
                },
                ChannelRequestHandler::MainchanStep(MainchanRequestKind::X11),
            );
        }
        if self.params.agent_forwarding {
            ctx.send_request("auth-agent-req@openssh.com", true, |_| {}, ChannelRequestHandler::MainchanStep(MainchanRequestKind::AuthAgent));
        }
        if !self.params.no_pty {
            self.requested_size = self.current_size.or(Some(TermSize { width: 80, height: 24 }));
            let size = self.requested_size.unwrap();
            let modes = self.params.terminal_modes.clone();
            ctx.send_request(
                "pty-req",
                true,
                move |body| {
                    use crate::reader::PacketWriter;
                    body.put_string(b"xterm-256color");
                    body.put_u32(size.width);
                    body.put_u32(size.height);
                    body.put_u32(0);
                    body.put_u32(0);
                    crate::pty::encode_modes(&modes, body);
                },
                ChannelRequestHandler::MainchanStep(MainchanRequestKind::Pty),
            );
        }
        let env = std::mem::take(&mut self.pending_env);
        for (key, value) in env {
            let kind = MainchanRequestKind::Env(key.clone());
            ctx.send_request(
                "env",
                true,
                move |body| {
                    use crate::reader::PacketWriter;
                    body.put_string(key.as_bytes());
                    body.put_string(value.as_bytes());
                },
                ChannelRequestHandler::MainchanStep(kind),
            );
        }
        self.send_primary(ctx);
    }

    fn send_primary(&mut self, ctx: &mut ChanCtx<'_>) {
        use crate::reader::PacketWriter;
        if let Some(subsystem) = &self.params.subsystem {
            let subsystem = subsystem.clone();
            ctx.send_request(
                "subsystem",
                true,
                move |body| body.put_string(subsystem.as_bytes()),
                ChannelRequestHandler::MainchanStep(MainchanRequestKind::Primary),
            );
        } else if let Some(command) = &self.params.command {
            let command = command.clone();
            ctx.send_request("exec", true, move |body| body.put_string(command.as_bytes()), ChannelRequestHandler::MainchanStep(MainchanRequestKind::Primary));
        } else {
            ctx.send_request("shell", true, |_| {}, ChannelRequestHandler::MainchanStep(MainchanRequestKind::Primary));
        }
    }

    fn send_fallback(&mut self, ctx: &mut ChanCtx<'_>) {
        use crate::reader::PacketWriter;
        match &self.params.fallback_command {
            Some(fallback) => {
                let fallback = fallback.clone();
                ctx.send_request("exec", true, move |body| body.put_string(fallback.as_bytes()), ChannelRequestHandler::MainchanStep(MainchanRequestKind::Fallback));
            }
            None => {
                self.state = ReadinessState::Failed;
            }
        }
    }

    fn mark_ready(&mut self, ctx: &mut ChanCtx<'_>) {
        self.state = ReadinessState::Ready;
        self.ready_notify.notify_one();
        info!("main channel ready");
        // Deliver a terminal resize that arrived between `pty-req` and readiness (§4.5).
        if self.mode == MainchanMode::Session {
            if let Some(size) = self.current_size {
                if self.requested_size != Some(size) {
                    self.send_window_change(size, ctx);
                }
            }
        }
    }

    /// `128 + signum`, or `128` if the signal name can't be mapped (§4.5).
    pub fn exit_code_for_signal(&self, name: &str) -> u32 {
        crate::channel::exit_code_for_signal(signal_number(name))
    }
}

/// Maps the handful of signal names RFC 4254 §6.10 lists to POSIX numbers.
/// Returns `None` for anything not in that fixed set (§4.5's "map the name
/// to a host-defined signal number").
fn signal_number(name: &str) -> Option<u32> {
    Some(match name {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "TRAP" => 5,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "BUS" => 10,
        "SEGV" => 11,
        "SYS" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        "USR1" => 16,
        "USR2" => 17,
        _ => return None,
    })
}

impl ChannelSink for MainChan {
    fn open_confirmation(&mut self, ctx: &mut ChanCtx<'_>) {
        self.start_chain(ctx);
    }

    fn send(&mut self, _is_stderr: bool, data: &[u8]) -> usize {
        data.len();
        0
    }

    fn send_eof(&mut self) {
        self.mainchan_eof_pending = true;
    }

    fn rcvd_exit_status(&mut self, status: u32) {
        self.exit_code = Some(status);
    }

    fn rcvd_exit_signal(&mut self, name: &str, _core_dumped: bool, message: &str) {
        self.exit_code = Some(self.exit_code_for_signal(name));
        self.close_message = Some(message.to_string());
    }

    fn rcvd_exit_signal_numeric(&mut self, signum: u32, _core_dumped: bool, message: &str) {
        self.exit_code = Some(crate::channel::exit_code_for_signal(Some(signum)));
        self.close_message = Some(message.to_string());
    }

    fn want_close(&self, _sent_eof: bool, _rcvd_eof: bool) -> bool {
        self.state == ReadinessState::Failed
    }

    fn log_close_msg(&self) -> Option<String> {
        self.close_message.clone()
    }

    fn set_input_wanted(&mut self, wanted: bool) {
        self.input_wanted = wanted;
    }

    fn on_request_reply(&mut self, ctx: &mut ChanCtx<'_>, kind: &MainchanRequestKind, success: bool) {
        match kind {
            MainchanRequestKind::X11 | MainchanRequestKind::AuthAgent | MainchanRequestKind::Env(_) => {
                if !success {
                    warn!(?kind, "main channel setup request refused, continuing anyway");
                }
            }
            MainchanRequestKind::Pty => {
                if !success {
                    warn!("pty-req refused");
                }
            }
            MainchanRequestKind::Primary => {
                if success {
                    self.mark_ready(ctx);
                } else if self.params.fallback_command.is_some() {
                    self.send_fallback(ctx);
                } else {
                    self.state = ReadinessState::Failed;
                    warn!("primary command request refused and no fallback configured");
                }
            }
            MainchanRequestKind::Fallback => {
                if success {
                    self.mark_ready(ctx);
                } else {
                    self.state = ReadinessState::Failed;
                    warn!("fallback command request also refused");
                }
            }
        }
    }

    fn note_resize(&mut self, ctx: &mut ChanCtx<'_>, width: u32, height: u32) {
        let size = TermSize { width, height };
        self.current_size = Some(size);
        if self.is_ready() {
            self.send_window_change(size, ctx);
        }
    }

    fn user_signal(&mut self, ctx: &mut ChanCtx<'_>, name: &str) {
        if !self.is_ready() {
            return;
        }
        use crate::reader::PacketWriter;
        let name = name.to_string();
        ctx.send_request("signal", false, move |body| body.put_string(name.as_bytes()), ChannelRequestHandler::Discard);
    }

    fn user_break(&mut self, ctx: &mut ChanCtx<'_>, break_length_ms: u32) {
        if !self.is_ready() {
            return;
        }
        use crate::reader::PacketWriter;
        ctx.send_request("break", true, move |body| body.put_u32(break_length_ms), ChannelRequestHandler::Discard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::queue::PacketQueue;

    fn params() -> SessionParams {
        SessionParams {
            command: Some("true".into()),
            ..SessionParams::default()
        }
    }

    #[test]
    fn session_mode_chains_pty_then_primary() {
        let notify = Arc::new(Notify::new());
        let sink = MainChan::new(MainchanMode::Session, params(), notify);
        let mut ch = ChannelState::new_outbound(256, "session", crate::channel::DEFAULT_WIN, Box::new(sink));
        let mut out = PacketQueue::new();
        ch.open_confirmation(9, crate::channel::DEFAULT_WIN, 0x8000, &mut out);
        // pty-req, then exec: two outstanding requests queued.
        assert_eq!(ch.requests.len(), 2);
    }

    #[test]
    fn direct_tcpip_is_ready_immediately() {
        let notify = Arc::new(Notify::new());
        let mut sink = MainChan::new(MainchanMode::DirectTcpip, SessionParams::default(), notify);
        let mut out = PacketQueue::new();
        let mut requests = std::collections::VecDeque::new();
        let mut ctx = ChanCtx { remote_id: 1, out: &mut out, requests: &mut requests };
        sink.open_confirmation(&mut ctx);
        assert!(sink.is_ready());
    }

    #[test]
    fn exit_signal_numeric_maps_unknown_name_to_bare_128() {
        let notify = Arc::new(Notify::new());
        let sink = MainChan::new(MainchanMode::Session, params(), notify);
        assert_eq!(sink.exit_code_for_signal("TOTALLY_UNKNOWN"), 128);
        assert_eq!(sink.exit_code_for_signal("TERM"), 143);
    }

    #[test]
    fn fallback_used_when_primary_refused() {
        let notify = Arc::new(Notify::new());
        let mut sink = MainChan::new(
            MainchanMode::Session,
            SessionParams {
                command: Some("nonexistent".into()),
                fallback_command: Some("sh".into()),
                ..SessionParams::default()
            },
            notify,
        );
        let mut out = PacketQueue::new();
        let mut requests = std::collections::VecDeque::new();
        let mut ctx = ChanCtx { remote_id: 1, out: &mut out, requests: &mut requests };
        sink.on_request_reply(&mut ctx, &MainchanRequestKind::Primary, false);
        assert!(!sink.is_ready());
        assert_eq!(out.len(), 1);
        sink.on_request_reply(&mut ctx, &MainchanRequestKind::Fallback, true);
        assert!(sink.is_ready());
    }

    #[test]
    fn pty_req_encodes_configured_terminal_modes() {
        let notify = Arc::new(Notify::new());
        let params = SessionParams {
            command: Some("true".into()),
            terminal_modes: vec![(crate::pty::TerminalMode::ECHO, 0)],
            ..SessionParams::default()
        };
        let sink = MainChan::new(MainchanMode::Session, params, notify);
        let mut ch = ChannelState::new_outbound(256, "session", crate::channel::DEFAULT_WIN, Box::new(sink));
        let mut out = PacketQueue::new();
        ch.open_confirmation(9, crate::channel::DEFAULT_WIN, 0x8000, &mut out);
        let pty_req = out.pop().expect("pty-req queued first");

        let mut cur = crate::reader::PacketCursor::new(&pty_req.body);
        cur.read_u32().unwrap(); // remote_id
        cur.read_utf8_string().unwrap(); // "pty-req"
        cur.read_bool().unwrap(); // want_reply
        cur.read_utf8_string().unwrap(); // TERM
        cur.read_u32().unwrap(); // width
        cur.read_u32().unwrap(); // height
        cur.read_u32().unwrap(); // pixel width
        cur.read_u32().unwrap(); // pixel height
        let modes = cur.read_string().unwrap();
        // opcode(1) + value(4) + TTY_OP_END(1), not the old hardcoded empty string.
        assert_eq!(modes.len(), 6);
        assert_eq!(modes.last(), Some(&0), "modes string ends with TTY_OP_END");
    }

    #[test]
    fn resize_before_ready_is_deferred_then_delivered_on_readiness() {
        let notify = Arc::new(Notify::new());
        let mut sink = MainChan::new(MainchanMode::Session, params(), notify);
        let mut out = PacketQueue::new();
        let mut requests = std::collections::VecDeque::new();
        let mut ctx = ChanCtx { remote_id: 1, out: &mut out, requests: &mut requests };
        // pty-req requests 80x24; a resize to 100x40 arrives before readiness.
        sink.note_resize(&mut ctx, 100, 40);
        assert_eq!(out.len(), 0);
        sink.on_request_reply(&mut ctx, &MainchanRequestKind::Primary, true);
        assert!(sink.is_ready());
        assert_eq!(out.len(), 1, "window-change should be sent once ready");
    }
}
