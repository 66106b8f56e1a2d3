use thiserror::Error;

use crate::channel::OpenFailureReason;

/// Errors the connection layer can raise, grouped per the taxonomy in the
/// error-handling design: protocol violations by the peer, peer-initiated
/// disconnects, local invariant violations (these are bugs, see `debug_assert!`
/// call sites instead), channel-open refusals, and I/O underneath the BPP.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The peer sent something that violates RFC 4254. Tears the connection
    /// down with `SSH_MSG_DISCONNECT` / `PROTOCOL_ERROR`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer sent `SSH_MSG_DISCONNECT`.
    #[error("peer disconnected (reason {reason_code}): {message}")]
    PeerDisconnected { reason_code: u32, message: String },

    /// A `CHANNEL_OPEN` we sent was refused.
    #[error("channel open refused ({reason:?}): {message}")]
    ChannelOpenRefused {
        reason: OpenFailureReason,
        message: String,
    },

    /// Host-key verification aborted the connection before it could open.
    #[error("host key rejected: {0}")]
    HostKeyRejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConnError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        ConnError::Protocol(msg.into())
    }
}

/// Outcome of the host-key decision procedure (§4.6). Not folded into
/// `ConnError`: a `SwAbort` is a policy decision, not necessarily a defect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeatPromptResult {
    Ok,
    UserAbort,
    SwAbort(String),
}
