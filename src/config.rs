//! Connection configuration (§10.3). Grounded on `thrussh::client::Config` /
//! `thrussh::server::Config` in `thrussh/src/{client,server}/mod.rs`: a plain
//! struct built once up front and handed to the connection state, with a
//! `Default` impl seeding the same literal tunables the original uses.

use crate::channel::DEFAULT_WIN;
use crate::connection::OUR_MAXPKT;
use crate::pty::TerminalMode;

/// The main channel's session parameters (§4.5): what to run, and what
/// auxiliary requests to chain before running it.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub x11_forwarding: bool,
    pub agent_forwarding: bool,
    pub no_pty: bool,
    pub env: Vec<(String, String)>,
    pub subsystem: Option<String>,
    pub command: Option<String>,
    pub fallback_command: Option<String>,
    /// Opcode/value pairs encoded into `pty-req`'s terminal-modes string
    /// (RFC 4254 §8) via `pty::encode_modes`. Empty by default, which encodes
    /// to a zero-length string — "no modes" (§8 scenario 1).
    pub terminal_modes: Vec<(TerminalMode, u32)>,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            x11_forwarding: false,
            agent_forwarding: false,
            no_pty: false,
            env: Vec::new(),
            subsystem: None,
            command: None,
            fallback_command: None,
            terminal_modes: Vec::new(),
        }
    }
}

/// A manually configured acceptable host key (§4.6 step 1): either a
/// fingerprint (the hash part, without the leading `"alg bits "` prefix) or
/// the base64-encoded raw public key blob, or both.
#[derive(Debug, Clone)]
pub struct ManualHostKey {
    pub fingerprint: Option<String>,
    pub base64_blob: Option<String>,
}

/// Immutable configuration for a connection (§10.3). Constructed once and
/// handed to the connection-state constructor.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub ssh_is_simple: bool,
    pub local_window: u32,
    pub our_maxpkt: u32,
    pub ssh_nc_host: Option<String>,
    pub session: SessionParams,
    pub manual_host_keys: Vec<ManualHostKey>,
    /// Standing in for "running non-interactively" (§4.6, §7): when false,
    /// every host-key prompt path becomes `SeatPromptResult::SwAbort`.
    pub interactive: bool,
    pub persistent: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            ssh_is_simple: false,
            local_window: DEFAULT_WIN,
            our_maxpkt: OUR_MAXPKT,
            ssh_nc_host: None,
            session: SessionParams::default(),
            manual_host_keys: Vec::new(),
            interactive: true,
            persistent: false,
        }
    }
}
