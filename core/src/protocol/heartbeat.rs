//! Fixed-size heartbeat frames carried over UDP multicast
//!
//! Layout (8 bytes):
//! - 3 bytes: magic `"csf"`
//! - 1 byte: command
//! - 4 bytes: sender's TCP package port, little-endian u32

use std::fmt;

use thiserror::Error;

use super::constants::{HEARTBEAT_FRAME_LEN, HEARTBEAT_MAGIC};

/// Heartbeat command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeartbeatCommand {
    /// Periodic liveness announcement, answered with `Response`
    Heartbeat = 0,
    /// Reply to a heartbeat, carries the responder's package port
    Response = 1,
    /// Port announcement; recognized but not acted upon
    BroadcastPort = 2,
    /// Sender is leaving the network
    Offline = 3,
}

impl HeartbeatCommand {
    /// Map a wire byte to a command, `None` for anything unrecognized
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Heartbeat),
            1 => Some(Self::Response),
            2 => Some(Self::BroadcastPort),
            3 => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for HeartbeatCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Heartbeat => "Heartbeat",
            Self::Response => "Response",
            Self::BroadcastPort => "BroadcastPort",
            Self::Offline => "Offline",
        };
        f.write_str(name)
    }
}

/// Reason a datagram was rejected as a heartbeat frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidFrame {
    #[error("incorrect heartbeat size: {0} bytes (expected {expected})", expected = HEARTBEAT_FRAME_LEN)]
    Length(usize),

    #[error("bad magic {0:02x?}")]
    Magic([u8; 3]),

    #[error("unknown command 0x{0:02x}")]
    Command(u8),
}

/// A decoded, valid heartbeat frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatFrame {
    pub command: HeartbeatCommand,
    pub port: u32,
}

impl HeartbeatFrame {
    pub fn new(command: HeartbeatCommand, port: u32) -> Self {
        Self { command, port }
    }

    /// Encode to the fixed wire layout
    pub fn encode(&self) -> [u8; HEARTBEAT_FRAME_LEN] {
        let mut buf = [0u8; HEARTBEAT_FRAME_LEN];
        buf[..3].copy_from_slice(&HEARTBEAT_MAGIC);
        buf[3] = self.command.as_byte();
        buf[4..].copy_from_slice(&self.port.to_le_bytes());
        buf
    }

    /// Decode a datagram. Any deviation from the fixed layout is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidFrame> {
        if bytes.len() != HEARTBEAT_FRAME_LEN {
            return Err(InvalidFrame::Length(bytes.len()));
        }

        let magic = [bytes[0], bytes[1], bytes[2]];
        if magic != HEARTBEAT_MAGIC {
            return Err(InvalidFrame::Magic(magic));
        }

        let command = HeartbeatCommand::from_byte(bytes[3])
            .ok_or(InvalidFrame::Command(bytes[3]))?;

        let mut port = [0u8; 4];
        port.copy_from_slice(&bytes[4..]);

        Ok(Self {
            command,
            port: u32::from_le_bytes(port),
        })
    }
}

/// Encode a heartbeat frame for `command` carrying `port`
pub fn encode_heartbeat(command: HeartbeatCommand, port: u32) -> [u8; HEARTBEAT_FRAME_LEN] {
    HeartbeatFrame::new(command, port).encode()
}

/// Decode a heartbeat datagram
pub fn decode_heartbeat(bytes: &[u8]) -> Result<HeartbeatFrame, InvalidFrame> {
    HeartbeatFrame::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_COMMANDS: [HeartbeatCommand; 4] = [
        HeartbeatCommand::Heartbeat,
        HeartbeatCommand::Response,
        HeartbeatCommand::BroadcastPort,
        HeartbeatCommand::Offline,
    ];

    #[test]
    fn test_heartbeat_roundtrip() {
        for command in ALL_COMMANDS {
            for port in [0, 1, 9001, 41690, u32::MAX] {
                let bytes = encode_heartbeat(command, port);
                assert_eq!(bytes.len(), 8);
                let frame = decode_heartbeat(&bytes).unwrap();
                assert_eq!(frame, HeartbeatFrame::new(command, port));
            }
        }
    }

    #[test]
    fn test_wire_layout() {
        let bytes = encode_heartbeat(HeartbeatCommand::Response, 9001);
        assert_eq!(bytes, [0x63, 0x73, 0x66, 0x01, 0x29, 0x23, 0x00, 0x00]);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let bytes = encode_heartbeat(HeartbeatCommand::Heartbeat, 1);
        assert_eq!(decode_heartbeat(&[]), Err(InvalidFrame::Length(0)));
        assert_eq!(decode_heartbeat(&bytes[..7]), Err(InvalidFrame::Length(7)));

        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(decode_heartbeat(&long), Err(InvalidFrame::Length(9)));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = encode_heartbeat(HeartbeatCommand::Heartbeat, 1);
        bytes[1] = b'x';
        assert_eq!(
            decode_heartbeat(&bytes),
            Err(InvalidFrame::Magic([0x63, b'x', 0x66]))
        );
    }

    #[test]
    fn test_rejects_unknown_command() {
        let mut bytes = encode_heartbeat(HeartbeatCommand::Heartbeat, 1);
        for command in 4..=u8::MAX {
            bytes[3] = command;
            assert_eq!(decode_heartbeat(&bytes), Err(InvalidFrame::Command(command)));
        }
    }

    #[test]
    fn test_invalid_frame_messages() {
        assert_eq!(
            InvalidFrame::Magic([0xde, 0xad, 0x00]).to_string(),
            "bad magic [de, ad, 00]"
        );
        assert_eq!(InvalidFrame::Command(0x7f).to_string(), "unknown command 0x7f");
        assert_eq!(
            InvalidFrame::Length(3).to_string(),
            "incorrect heartbeat size: 3 bytes (expected 8)"
        );
    }
}
