//! Wire-level command codes.
//!
//! Codes are partitioned into ranges:
//!
//! ```text
//! 0x0001 - 0x00FF  core / connection control / handshake
//! 0x0100 - 0x01FF  generic bidirectional data
//! 0x1000 - 0xFFFF  reserved, one sub-range per module family
//! ```
//!
//! A module claiming a sub-range is a convention between peers; nothing here
//! enforces ownership of module codes.

use std::fmt;

/// Known command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandType {
    Ping = 0x0001,
    Pong = 0x0002,
    ErrorGeneric = 0x0003,
    Hello = 0x0004,
    HelloAck = 0x0005,
    Heartbeat = 0x0006,
    Ack = 0x0007,
    ModuleUnavailable = 0x0008,
    /// Handshake rejected; payload carries the reason, the connection is then closed.
    HandshakeFailed = 0x0009,

    DataRequest = 0x0100,
    DataResponse = 0x0101,
    DataPush = 0x0102,
}

/// Range a raw command code falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRange {
    Control,
    Data,
    Module,
    Unassigned,
}

impl CommandType {
    /// Raw wire value
    #[inline]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Classify any raw code, known or not.
    pub fn range(code: u16) -> CommandRange {
        match code {
            0x0001..=0x00FF => CommandRange::Control,
            0x0100..=0x01FF => CommandRange::Data,
            0x1000..=0xFFFF => CommandRange::Module,
            _ => CommandRange::Unassigned,
        }
    }

    /// Upper-case protocol name, as used in logs.
    pub fn name(self) -> &'static str {
        match self {
            CommandType::Ping => "PING",
            CommandType::Pong => "PONG",
            CommandType::ErrorGeneric => "ERROR_GENERIC",
            CommandType::Hello => "HELLO",
            CommandType::HelloAck => "HELLO_ACK",
            CommandType::Heartbeat => "HEARTBEAT",
            CommandType::Ack => "ACK",
            CommandType::ModuleUnavailable => "MODULE_UNAVAILABLE",
            CommandType::HandshakeFailed => "HANDSHAKE_FAILED",
            CommandType::DataRequest => "DATA_REQUEST",
            CommandType::DataResponse => "DATA_RESPONSE",
            CommandType::DataPush => "DATA_PUSH",
        }
    }
}

impl TryFrom<u16> for CommandType {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        let command = match code {
            0x0001 => CommandType::Ping,
            0x0002 => CommandType::Pong,
            0x0003 => CommandType::ErrorGeneric,
            0x0004 => CommandType::Hello,
            0x0005 => CommandType::HelloAck,
            0x0006 => CommandType::Heartbeat,
            0x0007 => CommandType::Ack,
            0x0008 => CommandType::ModuleUnavailable,
            0x0009 => CommandType::HandshakeFailed,
            0x0100 => CommandType::DataRequest,
            0x0101 => CommandType::DataResponse,
            0x0102 => CommandType::DataPush,
            other => return Err(other),
        };
        Ok(command)
    }
}

impl From<CommandType> for u16 {
    fn from(command: CommandType) -> Self {
        command.code()
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_roundtrip() {
        for command in [
            CommandType::Ping,
            CommandType::Hello,
            CommandType::HandshakeFailed,
            CommandType::DataPush,
        ] {
            assert_eq!(CommandType::try_from(command.code()), Ok(command));
        }
        assert_eq!(CommandType::try_from(0x1001), Err(0x1001));
    }

    #[test]
    fn test_ranges() {
        assert_eq!(CommandType::range(CommandType::Ack.code()), CommandRange::Control);
        assert_eq!(CommandType::range(CommandType::DataPush.code()), CommandRange::Data);
        assert_eq!(CommandType::range(0x2001), CommandRange::Module);
        assert_eq!(CommandType::range(0x0000), CommandRange::Unassigned);
        assert_eq!(CommandType::range(0x0200), CommandRange::Unassigned);
    }
}
