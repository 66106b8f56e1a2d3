//! Terminal mode encoding for `pty-req` (RFC 4254 §6.2). The teacher's
//! `Cargo.toml` lists a `pty.rs` module but the filtered example pack doesn't
//! carry its source, so this is authored fresh in the crate's idiom: a small
//! opcode/value table serialized the way `PacketWriter` serializes everything
//! else above the BPP.

use crate::reader::PacketWriter;

/// A POSIX terminal mode opcode (RFC 4254 §8, a subset of `termios` flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum TerminalMode {
    VINTR,
    VQUIT,
    VERASE,
    VKILL,
    VEOF,
    VEOL,
    ICRNL,
    ICANON,
    ISIG,
    ECHO,
    ONLCR,
    OPOST,
}

impl TerminalMode {
    fn opcode(self) -> u8 {
        match self {
            TerminalMode::VINTR => 1,
            TerminalMode::VQUIT => 2,
            TerminalMode::VERASE => 3,
            TerminalMode::VKILL => 4,
            TerminalMode::VEOF => 5,
            TerminalMode::VEOL => 6,
            TerminalMode::ICRNL => 36,
            TerminalMode::ICANON => 52,
            TerminalMode::ISIG => 53,
            TerminalMode::ECHO => 54,
            TerminalMode::ONLCR => 72,
            TerminalMode::OPOST => 70,
        }
    }
}

/// Encodes an opcode/value list into the `TTY_OP_END`-terminated byte string
/// `pty-req` carries as its last field, then writes it as an SSH string.
pub fn encode_modes(modes: &[(TerminalMode, u32)], out: &mut impl PacketWriter) {
    let mut buf = Vec::with_capacity(modes.len() * 5 + 1);
    for (mode, value) in modes {
        buf.push(mode.opcode());
        buf.extend_from_slice(&value.to_be_bytes());
    }
    buf.push(0); // TTY_OP_END
    out.put_string(&buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ends_with_tty_op_end() {
        let mut out: Vec<u8> = Vec::new();
        encode_modes(&[(TerminalMode::ECHO, 1), (TerminalMode::ISIG, 1)], &mut out);
        // u32 length prefix + 2*(1+4) + terminator byte.
        assert_eq!(out.len(), 4 + 2 * 5 + 1);
        assert_eq!(*out.last().unwrap(), 0);
    }
}
