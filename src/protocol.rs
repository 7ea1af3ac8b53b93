//! Game protocol codec: primitive encoding, packet definitions,
//! batching and compression.

pub mod batch;
pub mod compression;
mod decoder;
mod encoder;
pub mod packet;

pub use decoder::{Decode, DecodeError, Decoder};
pub use encoder::{var_uint_size, Encode, Encoder};

/// Protocol revisions a client may connect with, paired with the game
/// version that introduced them.
pub const ACCEPTED_PROTOCOLS: &[(i32, &str)] = &[
    (818, "1.21.90"),
    (819, "1.21.93"),
    (827, "1.21.100"),
    (844, "1.21.111"),
    (859, "1.21.120"),
    (860, "1.21.124"),
];

pub const CURRENT_PROTOCOL: i32 = 860;

/// First protocol revision whose login carries the
/// `{AuthenticationType, Certificate, Token}` envelope.
pub const AUTH_ENVELOPE_PROTOCOL: i32 = 818;

/// RakNet user packet id wrapping game traffic.
pub const GAME_PACKET_ID: u8 = 0xFE;

pub fn is_accepted_protocol(protocol: i32) -> bool {
    ACCEPTED_PROTOCOLS.iter().any(|(id, _)| *id == protocol)
}

/// Game version string for a protocol revision, if known.
pub fn protocol_version_name(protocol: i32) -> Option<&'static str> {
    ACCEPTED_PROTOCOLS
        .iter()
        .find(|(id, _)| *id == protocol)
        .map(|(_, name)| *name)
}
