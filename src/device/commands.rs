//! Command frames of the GQ-RFC1201 serial protocol.
//!
//! The angle brackets are part of every command, there is no generic
//! envelope. Responses carry neither a delimiter nor a length prefix, so each
//! command knows how many bytes the device answers with.

use std::fmt;

/// A command understood by GMC-300/320 firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Current counts per minute, answered with 2 bytes (big-endian).
    GetCpm,
    /// Device temperature, answered with 4 bytes.
    GetTemp,
    /// Hardware model and firmware version, answered with 14 ASCII bytes.
    GetVer,
    /// Turn off the unsolicited once-per-second CPM push. No answer.
    Heartbeat0,
}

impl Command {
    /// Raw bytes written to the serial port.
    pub const fn frame(self) -> &'static [u8] {
        match self {
            Command::GetCpm => b"<GETCPM>>",
            Command::GetTemp => b"<GETTEMP>>",
            Command::GetVer => b"<GETVER>>",
            Command::Heartbeat0 => b"<HEARTBEAT0>>",
        }
    }

    /// Number of bytes the device sends back.
    pub const fn response_len(self) -> usize {
        match self {
            Command::GetCpm => 2,
            Command::GetTemp => 4,
            Command::GetVer => 14,
            Command::Heartbeat0 => 0,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Command::GetCpm => "GETCPM",
            Command::GetTemp => "GETTEMP",
            Command::GetVer => "GETVER",
            Command::Heartbeat0 => "HEARTBEAT0",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
