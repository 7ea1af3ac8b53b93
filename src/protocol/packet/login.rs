//! Packets exchanged before the player is logged in.

use crate::protocol::{decoder, Decode, Decoder, Encode, Encoder};
use aquarelay_macros::{Decode, Encode};

/// First packet of a connection. Unlike every other packet it is sent
/// without batching or compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestNetworkSettings {
    pub protocol: i32,
}

impl Encode for RequestNetworkSettings {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i32(self.protocol);
    }
}

impl Decode for RequestNetworkSettings {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        Ok(Self {
            protocol: decoder.read_i32()?,
        })
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct NetworkSettings {
    pub compression_threshold: u16,
    pub compression_algorithm: u16,
    pub enable_client_throttling: bool,
    pub client_throttle_threshold: u8,
    pub client_throttle_scalar: f32,
}

impl NetworkSettings {
    /// Any batch of at least this many bytes is compressed.
    pub const COMPRESS_EVERYTHING: u16 = 1;
}

/// Login request: protocol revision, the authentication envelope (JSON)
/// and the client data JWT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub protocol: i32,
    pub auth_info_json: String,
    pub client_data_jwt: String,
}

fn read_i32_le_string(decoder: &mut Decoder) -> decoder::Result<String> {
    let length = usize::try_from(decoder.read_i32_le()?)?;
    let bytes = decoder.consume_slice(length)?;
    Ok(std::str::from_utf8(bytes)?.to_owned())
}

fn write_i32_le_string(encoder: &mut Encoder, s: &str) {
    encoder.write_i32_le(s.len().try_into().unwrap_or(i32::MAX));
    encoder.write_slice(s.as_bytes());
}

impl Encode for Login {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i32(self.protocol);
        let mut connection_request = Vec::new();
        let mut inner = Encoder::new(&mut connection_request);
        write_i32_le_string(&mut inner, &self.auth_info_json);
        write_i32_le_string(&mut inner, &self.client_data_jwt);
        encoder.write_byte_array(&connection_request);
    }
}

impl Decode for Login {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let protocol = decoder.read_i32()?;
        let mut inner = Decoder::new(decoder.read_byte_array()?);
        let auth_info_json = read_i32_le_string(&mut inner)?;
        let client_data_jwt = read_i32_le_string(&mut inner)?;
        Ok(Self {
            protocol,
            auth_info_json,
            client_data_jwt,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayStatus {
    pub status: i32,
}

impl PlayStatus {
    pub const LOGIN_SUCCESS: i32 = 0;
    pub const LOGIN_FAILED_CLIENT: i32 = 1;
    pub const LOGIN_FAILED_SERVER: i32 = 2;
    pub const PLAYER_SPAWN: i32 = 3;

    pub fn new(status: i32) -> Self {
        Self { status }
    }
}

impl Encode for PlayStatus {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_i32(self.status);
    }
}

impl Decode for PlayStatus {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        Ok(Self {
            status: decoder.read_i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: i32,
    /// `None` hides the disconnect screen message.
    pub message: Option<String>,
    pub filtered_message: String,
}

impl Disconnect {
    /// Generic "disconnected" reason code.
    pub const REASON_UNKNOWN: i32 = 0;

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            reason: Self::REASON_UNKNOWN,
            message: Some(message.into()),
            filtered_message: String::new(),
        }
    }
}

impl Encode for Disconnect {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_int(self.reason);
        encoder.write_bool(self.message.is_none());
        if let Some(message) = &self.message {
            encoder.write_string(message);
            encoder.write_string(&self.filtered_message);
        }
    }
}

impl Decode for Disconnect {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let reason = decoder.read_var_int()?;
        let skip_message = decoder.read_bool()?;
        if skip_message {
            return Ok(Self {
                reason,
                message: None,
                filtered_message: String::new(),
            });
        }
        let message = decoder.read_string()?.to_owned();
        let filtered_message = if decoder.is_finished() {
            String::new()
        } else {
            decoder.read_string()?.to_owned()
        };
        Ok(Self {
            reason,
            message: Some(message),
            filtered_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::GamePacket;

    #[test]
    fn login_layout() {
        let login = Login {
            protocol: 860,
            auth_info_json: "{}".to_owned(),
            client_data_jwt: "a.b.c".to_owned(),
        };
        let bytes = GamePacket::Login(login.clone()).to_bytes();
        // id, protocol (big-endian), varuint length of the inner blob
        assert_eq!(&bytes[..6], &[0x01, 0x00, 0x00, 0x03, 0x5c, 4 + 2 + 4 + 5]);
        match GamePacket::decode(&bytes).unwrap() {
            GamePacket::Login(decoded) => assert_eq!(decoded, login),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn play_status_is_big_endian() {
        let bytes = GamePacket::PlayStatus(PlayStatus::new(PlayStatus::PLAYER_SPAWN)).to_bytes();
        assert_eq!(bytes, [0x02, 0x00, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn disconnect_without_message() {
        let packet = Disconnect {
            reason: 0,
            message: None,
            filtered_message: String::new(),
        };
        let bytes = GamePacket::Disconnect(packet.clone()).to_bytes();
        assert_eq!(bytes, [0x05, 0x00, 0x01]);
        match GamePacket::decode(&bytes).unwrap() {
            GamePacket::Disconnect(decoded) => assert_eq!(decoded, packet),
            other => panic!("unexpected {other:?}"),
        }
    }
}
