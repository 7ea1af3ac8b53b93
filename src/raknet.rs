//! Minimal RakNet: the subset of the transport both halves of the relay
//! need to carry game traffic.
//!
//! There is no congestion control and no encryption. Every outbound
//! payload is sent reliable-ordered on channel 0; inbound frames of any
//! reliability are accepted and processed in arrival order.

use crate::protocol::DecodeError;
use bitflags::bitflags;
use std::time::Duration;

pub mod frame;
mod link;
pub mod message;
mod split;

pub use frame::{AckRecord, Datagram, Frame, SplitInfo};
pub use link::{ReliableLink, Received};
pub use split::{fragment, SplitAssembler};

pub const PROTOCOL_VERSION: u8 = 11;

pub const MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00, 0xFE, 0xFE, 0xFE, 0xFE, 0xFD, 0xFD, 0xFD, 0xFD, 0x12, 0x34, 0x56, 0x78,
];

pub const MAX_MTU: u16 = 1400;
pub const MIN_MTU: u16 = 576;

/// Room left in every datagram for the datagram and frame headers.
pub const HEADER_MARGIN: usize = 60;

/// IP and UDP header bytes counted in an MTU but not in a UDP payload.
pub const UDP_OVERHEAD: usize = 28;

/// Number of addresses in the connection accepted / new incoming
/// connection messages.
pub const SYSTEM_ADDRESS_COUNT: usize = 20;

/// Idle time after which the upstream server drops a client.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// MTU sizes tried in order during the open connection handshake.
pub fn mtu_candidates(max_mtu: u16) -> [u16; 3] {
    [max_mtu, 1200.min(max_mtu), MIN_MTU]
}

const U24_MASK: u32 = 0x00ff_ffff;

/// Returns the current value of a 24-bit counter and advances it,
/// wrapping at the field width.
pub fn next_u24(counter: &mut u32) -> u32 {
    let value = *counter & U24_MASK;
    *counter = (value + 1) & U24_MASK;
    value
}

/// Message ids.
pub mod id {
    pub const CONNECTED_PING: u8 = 0x00;
    pub const UNCONNECTED_PING: u8 = 0x01;
    pub const UNCONNECTED_PING_OPEN_CONNECTIONS: u8 = 0x02;
    pub const CONNECTED_PONG: u8 = 0x03;
    pub const OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
    pub const OPEN_CONNECTION_REPLY_1: u8 = 0x06;
    pub const OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
    pub const OPEN_CONNECTION_REPLY_2: u8 = 0x08;
    pub const CONNECTION_REQUEST: u8 = 0x09;
    pub const CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
    pub const NEW_INCOMING_CONNECTION: u8 = 0x13;
    pub const DISCONNECTION_NOTIFICATION: u8 = 0x15;
    pub const INCOMPATIBLE_PROTOCOL_VERSION: u8 = 0x19;
    pub const UNCONNECTED_PONG: u8 = 0x1C;
    pub const NACK: u8 = 0xA0;
    pub const ACK: u8 = 0xC0;
}

bitflags! {
    /// Flags in the first byte of an online datagram.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DatagramFlags: u8 {
        const VALID = 0b1000_0000;
        const ACK = 0b0100_0000;
        const NACK = 0b0010_0000;
        const NEEDS_B_AND_AS = 0b0000_0100;
    }
}

impl DatagramFlags {
    /// Flags of an outbound frame set.
    pub const FRAME_SET: Self = Self::VALID.union(Self::NEEDS_B_AND_AS);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub fn from_bits(bits: u8) -> Result<Self, RakNetError> {
        Ok(match bits {
            0 => Self::Unreliable,
            1 => Self::UnreliableSequenced,
            2 => Self::Reliable,
            3 => Self::ReliableOrdered,
            4 => Self::ReliableSequenced,
            5 => Self::UnreliableWithAckReceipt,
            6 => Self::ReliableWithAckReceipt,
            7 => Self::ReliableOrderedWithAckReceipt,
            other => return Err(RakNetError::UnknownReliability(other)),
        })
    }

    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::Reliable
                | Self::ReliableOrdered
                | Self::ReliableSequenced
                | Self::ReliableWithAckReceipt
                | Self::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_sequenced(self) -> bool {
        matches!(self, Self::UnreliableSequenced | Self::ReliableSequenced)
    }

    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Self::UnreliableSequenced
                | Self::ReliableOrdered
                | Self::ReliableSequenced
                | Self::ReliableOrderedWithAckReceipt
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RakNetError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("unknown reliability {0}")]
    UnknownReliability(u8),
    #[error("offline message without the magic sequence")]
    BadMagic,
    #[error("unexpected message id {0:#04x}")]
    UnexpectedMessage(u8),
    #[error("invalid split part {index}/{count} for split {id}")]
    InvalidSplit { id: u16, index: u32, count: u32 },
    #[error("too many concurrent split packets")]
    TooManySplits,
    #[error("split {id} exceeds {limit} buffered bytes")]
    SplitTooLarge { id: u16, limit: usize },
    #[error("unsupported address family {0}")]
    AddressFamily(u8),
}
