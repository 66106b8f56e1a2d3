//! SSH-2 connection layer: packet queues, channel multiplexing, sliding
//! window flow control and the main session channel, sitting directly on
//! top of an already-authenticated binary packet protocol.
//!
//! This crate does not perform key exchange, user authentication, or any
//! cipher/MAC work — it assumes a transport that already hands up decrypted,
//! sequenced packets (see [`bpp`]) and starts from there.

pub mod bignum;
pub mod bpp;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod hostkey;
pub mod mainchan;
pub mod msg;
pub mod packet;
pub mod pty;
pub mod queue;
pub mod reader;
pub mod sha512;

pub use config::{ConnectionConfig, ManualHostKey, SessionParams};
pub use connection::ConnectionState;
pub use error::{ConnError, SeatPromptResult};
