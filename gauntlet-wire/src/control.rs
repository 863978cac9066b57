//! Control channel messages.
//!
//! The handshake (`Hello`, `Login`, `Join`, `BeaconJoin`) plus the
//! multiplexed harness control message carrying a one-byte sub-command.
//! Strings travel as a little-endian u16 length prefix followed by UTF-8.

use crate::error::WireError;

/// Magic value identifying a harness `Hello`.
pub const HELLO_MAGIC: u32 = 0x474E_5431; // "GNT1"

/// One-byte sub-commands of the multiplexed harness control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HarnessCmd {
    /// Run a console command on the server, discarding any result.
    NoResult = 0,
    /// Run a console command and stream the result back.
    SendResult = 1,
    /// A previously requested command failed to produce a result.
    ResultFailed = 2,
    /// The requested command result follows in the argument.
    ResultSuccess = 3,
    /// Round-trip probe request.
    Ping = 4,
    /// Round-trip probe reply.
    Pong = 5,
    /// Ask the server to watch for a named engine event.
    WatchEvent = 6,
    /// Server-side notification that a watched event fired.
    NotifyEvent = 7,
    /// Ask the server to spawn a named actor class.
    Summon = 8,
    /// Ask the server process to suspend itself.
    SuspendProcess = 9,
}

impl HarnessCmd {
    /// Parse a sub-command byte.
    ///
    /// # Errors
    ///
    /// Returns `UnknownHarnessCommand` for unregistered bytes.
    pub fn from_byte(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => HarnessCmd::NoResult,
            1 => HarnessCmd::SendResult,
            2 => HarnessCmd::ResultFailed,
            3 => HarnessCmd::ResultSuccess,
            4 => HarnessCmd::Ping,
            5 => HarnessCmd::Pong,
            6 => HarnessCmd::WatchEvent,
            7 => HarnessCmd::NotifyEvent,
            8 => HarnessCmd::Summon,
            9 => HarnessCmd::SuspendProcess,
            other => return Err(WireError::UnknownHarnessCommand { value: other }),
        })
    }
}

/// Messages carried on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Version/endianness handshake. First message on the wire.
    Hello {
        /// Protocol version the client speaks.
        protocol_version: u32,
        /// Endianness/identity magic; must equal [`HELLO_MAGIC`].
        magic: u32,
    },
    /// Credentials plus connect URL.
    Login {
        /// Opaque auth token.
        token: String,
        /// Connect URL, including any option suffix.
        url: String,
    },
    /// Triggers the server-side player spawn.
    Join,
    /// Triggers a server-side beacon spawn instead of a player.
    BeaconJoin {
        /// Beacon type name to join.
        beacon_type: String,
    },
    /// Multiplexed harness command with a string argument.
    Harness(HarnessCmd, String),
}

const MSG_HELLO: u8 = 0;
const MSG_LOGIN: u8 = 1;
const MSG_JOIN: u8 = 2;
const MSG_BEACON_JOIN: u8 = 3;
const MSG_HARNESS: u8 = 4;

fn put_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take_string(data: &[u8], offset: &mut usize) -> Result<String, WireError> {
    if data.len() < *offset + 2 {
        return Err(WireError::MalformedString);
    }
    let len = u16::from_le_bytes([data[*offset], data[*offset + 1]]) as usize;
    *offset += 2;

    if data.len() < *offset + len {
        return Err(WireError::MalformedString);
    }
    let value = std::str::from_utf8(&data[*offset..*offset + len])
        .map_err(|_| WireError::MalformedString)?
        .to_string();
    *offset += len;
    Ok(value)
}

fn take_u32(data: &[u8], offset: &mut usize) -> Result<u32, WireError> {
    if data.len() < *offset + 4 {
        return Err(WireError::InsufficientData {
            needed: *offset + 4,
            have: data.len(),
        });
    }
    let value = u32::from_le_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(value)
}

impl ControlMessage {
    /// Encode the message into a bunch payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ControlMessage::Hello {
                protocol_version,
                magic,
            } => {
                out.push(MSG_HELLO);
                out.extend_from_slice(&protocol_version.to_le_bytes());
                out.extend_from_slice(&magic.to_le_bytes());
            }
            ControlMessage::Login { token, url } => {
                out.push(MSG_LOGIN);
                put_string(&mut out, token);
                put_string(&mut out, url);
            }
            ControlMessage::Join => out.push(MSG_JOIN),
            ControlMessage::BeaconJoin { beacon_type } => {
                out.push(MSG_BEACON_JOIN);
                put_string(&mut out, beacon_type);
            }
            ControlMessage::Harness(cmd, arg) => {
                out.push(MSG_HARNESS);
                out.push(*cmd as u8);
                put_string(&mut out, arg);
            }
        }
        out
    }

    /// Decode a message from a bunch payload.
    ///
    /// # Errors
    ///
    /// Returns `UnknownControlMessage` for unregistered discriminants,
    /// `MalformedString`/`InsufficientData` for truncated fields.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let Some(&discriminant) = data.first() else {
            return Err(WireError::InsufficientData { needed: 1, have: 0 });
        };

        let mut offset = 1;
        match discriminant {
            MSG_HELLO => {
                let protocol_version = take_u32(data, &mut offset)?;
                let magic = take_u32(data, &mut offset)?;
                Ok(ControlMessage::Hello {
                    protocol_version,
                    magic,
                })
            }
            MSG_LOGIN => {
                let token = take_string(data, &mut offset)?;
                let url = take_string(data, &mut offset)?;
                Ok(ControlMessage::Login { token, url })
            }
            MSG_JOIN => Ok(ControlMessage::Join),
            MSG_BEACON_JOIN => {
                let beacon_type = take_string(data, &mut offset)?;
                Ok(ControlMessage::BeaconJoin { beacon_type })
            }
            MSG_HARNESS => {
                let Some(&cmd_byte) = data.get(offset) else {
                    return Err(WireError::InsufficientData {
                        needed: offset + 1,
                        have: data.len(),
                    });
                };
                offset += 1;
                let cmd = HarnessCmd::from_byte(cmd_byte)?;
                let arg = take_string(data, &mut offset)?;
                Ok(ControlMessage::Harness(cmd, arg))
            }
            other => Err(WireError::UnknownControlMessage {
                discriminant: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let msg = ControlMessage::Hello {
            protocol_version: 12,
            magic: HELLO_MAGIC,
        };
        assert_eq!(ControlMessage::decode(&msg.encode()).expect("decode"), msg);
    }

    #[test]
    fn test_login_roundtrip() {
        let msg = ControlMessage::Login {
            token: "auth-token".into(),
            url: "127.0.0.1:7787?name=probe".into(),
        };
        assert_eq!(ControlMessage::decode(&msg.encode()).expect("decode"), msg);
    }

    #[test]
    fn test_harness_command_roundtrip() {
        for cmd in [
            HarnessCmd::NoResult,
            HarnessCmd::SendResult,
            HarnessCmd::ResultFailed,
            HarnessCmd::ResultSuccess,
            HarnessCmd::Ping,
            HarnessCmd::Pong,
            HarnessCmd::WatchEvent,
            HarnessCmd::NotifyEvent,
            HarnessCmd::Summon,
            HarnessCmd::SuspendProcess,
        ] {
            let msg = ControlMessage::Harness(cmd, "arg".into());
            assert_eq!(ControlMessage::decode(&msg.encode()).expect("decode"), msg);
        }
    }

    #[test]
    fn test_unknown_discriminant() {
        assert!(matches!(
            ControlMessage::decode(&[200]),
            Err(WireError::UnknownControlMessage { discriminant: 200 })
        ));
    }

    #[test]
    fn test_unknown_harness_command() {
        let payload = vec![MSG_HARNESS, 99, 0, 0];
        assert!(matches!(
            ControlMessage::decode(&payload),
            Err(WireError::UnknownHarnessCommand { value: 99 })
        ));
    }

    #[test]
    fn test_truncated_string() {
        let mut payload = ControlMessage::Login {
            token: "long enough token".into(),
            url: "u".into(),
        }
        .encode();
        payload.truncate(6);
        assert!(matches!(
            ControlMessage::decode(&payload),
            Err(WireError::MalformedString)
        ));
    }

    #[test]
    fn test_empty_payload() {
        assert!(matches!(
            ControlMessage::decode(&[]),
            Err(WireError::InsufficientData { .. })
        ));
    }
}
