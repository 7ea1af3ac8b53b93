//! Offline (unconnected) and connected control messages.

use super::{id, RakNetError, MAGIC, SYSTEM_ADDRESS_COUNT, UDP_OVERHEAD};
use crate::protocol::{Decoder, Encoder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Address family tag for IPv6 socket addresses (`AF_INET6` on Windows).
const AF_INET6: u16 = 23;

pub fn write_address(encoder: &mut Encoder, address: SocketAddr) {
    match address {
        SocketAddr::V4(v4) => {
            encoder.write_u8(4);
            for octet in v4.ip().octets() {
                encoder.write_u8(!octet);
            }
            encoder.write_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            encoder.write_u8(6);
            encoder.write_u16_le(AF_INET6);
            encoder.write_u16(v6.port());
            encoder.write_u32(v6.flowinfo());
            encoder.write_slice(&v6.ip().octets());
            encoder.write_u32(v6.scope_id());
        }
    }
}

pub fn read_address(decoder: &mut Decoder) -> Result<SocketAddr, RakNetError> {
    match decoder.read_u8()? {
        4 => {
            let octets = decoder.consume::<4>()?.map(|b| !b);
            let port = decoder.read_u16()?;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        6 => {
            let _family = decoder.read_u16_le()?;
            let port = decoder.read_u16()?;
            let flowinfo = decoder.read_u32()?;
            let ip = Ipv6Addr::from(decoder.consume::<16>()?);
            let scope_id = decoder.read_u32()?;
            Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, flowinfo, scope_id)))
        }
        other => Err(RakNetError::AddressFamily(other)),
    }
}

fn unspecified_like(address: SocketAddr) -> SocketAddr {
    match address {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn write_system_addresses(encoder: &mut Encoder, address: SocketAddr) {
    write_address(encoder, address);
    for _ in 1..SYSTEM_ADDRESS_COUNT {
        write_address(encoder, unspecified_like(address));
    }
}

fn read_magic(decoder: &mut Decoder) -> Result<(), RakNetError> {
    if decoder.consume::<16>()? == MAGIC {
        Ok(())
    } else {
        Err(RakNetError::BadMagic)
    }
}

fn expect_id(decoder: &mut Decoder, expected: u8) -> Result<(), RakNetError> {
    match decoder.read_u8()? {
        found if found == expected => Ok(()),
        other => Err(RakNetError::UnexpectedMessage(other)),
    }
}

fn build(f: impl FnOnce(&mut Encoder)) -> Vec<u8> {
    let mut buf = Vec::new();
    f(&mut Encoder::new(&mut buf));
    buf
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPing {
    pub time: u64,
    pub client_guid: u64,
}

impl UnconnectedPing {
    pub fn encode(&self) -> Vec<u8> {
        build(|e| {
            e.write_u8(id::UNCONNECTED_PING);
            e.write_u64(self.time);
            e.write_slice(&MAGIC);
            e.write_u64(self.client_guid);
        })
    }

    /// Accepts both unconnected ping ids.
    pub fn decode(buffer: &[u8]) -> Result<Self, RakNetError> {
        let mut decoder = Decoder::new(buffer);
        match decoder.read_u8()? {
            id::UNCONNECTED_PING | id::UNCONNECTED_PING_OPEN_CONNECTIONS => {}
            other => return Err(RakNetError::UnexpectedMessage(other)),
        }
        let time = decoder.read_u64()?;
        read_magic(&mut decoder)?;
        let client_guid = decoder.read_u64()?;
        Ok(Self { time, client_guid })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    pub time: u64,
    pub server_guid: u64,
    pub motd: String,
}

impl UnconnectedPong {
    pub fn encode(&self) -> Vec<u8> {
        build(|e| {
            e.write_u8(id::UNCONNECTED_PONG);
            e.write_u64(self.time);
            e.write_u64(self.server_guid);
            e.write_slice(&MAGIC);
            e.write_u16(self.motd.len().try_into().unwrap_or(u16::MAX));
            e.write_slice(self.motd.as_bytes());
        })
    }
}

/// Open connection request 1. The message is zero-padded so that the
/// whole IP packet is `mtu` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest1 {
    pub protocol: u8,
    pub mtu: u16,
}

impl OpenConnectionRequest1 {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = build(|e| {
            e.write_u8(id::OPEN_CONNECTION_REQUEST_1);
            e.write_slice(&MAGIC);
            e.write_u8(self.protocol);
        });
        let padded = usize::from(self.mtu).saturating_sub(UDP_OVERHEAD);
        if buf.len() < padded {
            buf.resize(padded, 0);
        }
        buf
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, RakNetError> {
        let mut decoder = Decoder::new(buffer);
        expect_id(&mut decoder, id::OPEN_CONNECTION_REQUEST_1)?;
        read_magic(&mut decoder)?;
        let protocol = decoder.read_u8()?;
        let mtu = (buffer.len() + UDP_OVERHEAD).try_into().unwrap_or(u16::MAX);
        Ok(Self { protocol, mtu })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply1 {
    pub server_guid: u64,
    /// Present when the server uses security; echoed in request 2.
    pub cookie: Option<u32>,
    pub mtu: u16,
}

impl OpenConnectionReply1 {
    pub fn encode(&self) -> Vec<u8> {
        build(|e| {
            e.write_u8(id::OPEN_CONNECTION_REPLY_1);
            e.write_slice(&MAGIC);
            e.write_u64(self.server_guid);
            e.write_bool(self.cookie.is_some());
            if let Some(cookie) = self.cookie {
                e.write_u32(cookie);
            }
            e.write_u16(self.mtu);
        })
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, RakNetError> {
        let mut decoder = Decoder::new(buffer);
        expect_id(&mut decoder, id::OPEN_CONNECTION_REPLY_1)?;
        read_magic(&mut decoder)?;
        let server_guid = decoder.read_u64()?;
        let cookie = if decoder.read_bool()? {
            Some(decoder.read_u32()?)
        } else {
            None
        };
        let mtu = decoder.read_u16()?;
        Ok(Self {
            server_guid,
            cookie,
            mtu,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest2 {
    pub cookie: Option<u32>,
    pub server_address: SocketAddr,
    pub mtu: u16,
    pub client_guid: u64,
}

impl OpenConnectionRequest2 {
    pub fn encode(&self) -> Vec<u8> {
        build(|e| {
            e.write_u8(id::OPEN_CONNECTION_REQUEST_2);
            e.write_slice(&MAGIC);
            if let Some(cookie) = self.cookie {
                e.write_u32(cookie);
                // No client proof follows the cookie.
                e.write_bool(false);
            }
            write_address(e, self.server_address);
            e.write_u16(self.mtu);
            e.write_u64(self.client_guid);
        })
    }

    /// Decodes a request sent to a server that issued no cookie.
    pub fn decode(buffer: &[u8]) -> Result<Self, RakNetError> {
        let mut decoder = Decoder::new(buffer);
        expect_id(&mut decoder, id::OPEN_CONNECTION_REQUEST_2)?;
        read_magic(&mut decoder)?;
        let server_address = read_address(&mut decoder)?;
        let mtu = decoder.read_u16()?;
        let client_guid = decoder.read_u64()?;
        Ok(Self {
            cookie: None,
            server_address,
            mtu,
            client_guid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply2 {
    pub server_guid: u64,
    pub client_address: SocketAddr,
    pub mtu: u16,
}

impl OpenConnectionReply2 {
    pub fn encode(&self) -> Vec<u8> {
        build(|e| {
            e.write_u8(id::OPEN_CONNECTION_REPLY_2);
            e.write_slice(&MAGIC);
            e.write_u64(self.server_guid);
            write_address(e, self.client_address);
            e.write_u16(self.mtu);
            // Encryption disabled.
            e.write_bool(false);
        })
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, RakNetError> {
        let mut decoder = Decoder::new(buffer);
        expect_id(&mut decoder, id::OPEN_CONNECTION_REPLY_2)?;
        read_magic(&mut decoder)?;
        let server_guid = decoder.read_u64()?;
        let client_address = read_address(&mut decoder)?;
        let mtu = decoder.read_u16()?;
        Ok(Self {
            server_guid,
            client_address,
            mtu,
        })
    }
}

pub fn incompatible_protocol(server_guid: u64) -> Vec<u8> {
    build(|e| {
        e.write_u8(id::INCOMPATIBLE_PROTOCOL_VERSION);
        e.write_u8(super::PROTOCOL_VERSION);
        e.write_slice(&MAGIC);
        e.write_u64(server_guid);
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub client_guid: u64,
    pub time: u64,
}

impl ConnectionRequest {
    pub fn encode(&self) -> Vec<u8> {
        build(|e| {
            e.write_u8(id::CONNECTION_REQUEST);
            e.write_u64(self.client_guid);
            e.write_u64(self.time);
            // No security.
            e.write_bool(false);
        })
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, RakNetError> {
        let mut decoder = Decoder::new(buffer);
        expect_id(&mut decoder, id::CONNECTION_REQUEST)?;
        Ok(Self {
            client_guid: decoder.read_u64()?,
            time: decoder.read_u64()?,
        })
    }
}

pub fn connection_request_accepted(client_address: SocketAddr, request_time: u64, time: u64) -> Vec<u8> {
    build(|e| {
        e.write_u8(id::CONNECTION_REQUEST_ACCEPTED);
        write_address(e, client_address);
        e.write_u16(0);
        write_system_addresses(e, client_address);
        e.write_u64(request_time);
        e.write_u64(time);
    })
}

pub fn new_incoming_connection(server_address: SocketAddr, request_time: u64, time: u64) -> Vec<u8> {
    build(|e| {
        e.write_u8(id::NEW_INCOMING_CONNECTION);
        write_address(e, server_address);
        write_system_addresses(e, server_address);
        e.write_u64(request_time);
        e.write_u64(time);
    })
}

pub fn connected_ping(time: u64) -> Vec<u8> {
    build(|e| {
        e.write_u8(id::CONNECTED_PING);
        e.write_u64(time);
    })
}

pub fn connected_pong(ping_time: u64, pong_time: u64) -> Vec<u8> {
    build(|e| {
        e.write_u8(id::CONNECTED_PONG);
        e.write_u64(ping_time);
        e.write_u64(pong_time);
    })
}

/// Reads the timestamp of a connected ping, or the echoed ping time of a
/// connected pong.
pub fn read_ping_time(buffer: &[u8]) -> Result<u64, RakNetError> {
    let mut decoder = Decoder::new(buffer);
    decoder.read_u8()?;
    Ok(decoder.read_u64()?)
}

pub fn disconnection_notification() -> Vec<u8> {
    vec![id::DISCONNECTION_NOTIFICATION]
}
