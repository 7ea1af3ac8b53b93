//! Enumerates the game packets the relay inspects or produces.
//!
//! Full parsing of packets is _not_ implemented. Packets are decoded only
//! as far as the relay needs; everything else becomes an [`UnknownPacket`]
//! and is relayed from its original bytes. Packets the relay only ever
//! sends (or rewrites on demand) are also left opaque by
//! [`GamePacket::decode`].

use crate::protocol::{Decode, DecodeError, Decoder, Encode, Encoder};
use aquarelay_macros::FromVariants;
use bytes::Bytes;

pub mod commands;
pub mod login;
pub mod resource_pack;
pub mod ui;
pub mod world;

pub use commands::{AvailableCommands, CommandRequest};
pub use login::{Disconnect, Login, NetworkSettings, PlayStatus, RequestNetworkSettings};
pub use resource_pack::{
    ResourcePackChunkData, ResourcePackChunkRequest, ResourcePackClientResponse,
    ResourcePackDataInfo, ResourcePackStack, ResourcePacksInfo, ResponseStatus,
};
pub use ui::{ClientboundCloseForm, ModalFormRequest, ModalFormResponse, SetTitle, Text, ToastRequest};
pub use world::{
    ClientCacheStatus, LevelChunk, NetworkChunkPublisherUpdate, RequestChunkRadius, StartGame,
    Transfer,
};

/// Packet ids, as found in the low 10 bits of the packet header.
pub mod id {
    pub const LOGIN: u32 = 0x01;
    pub const PLAY_STATUS: u32 = 0x02;
    pub const DISCONNECT: u32 = 0x05;
    pub const RESOURCE_PACKS_INFO: u32 = 0x06;
    pub const RESOURCE_PACK_STACK: u32 = 0x07;
    pub const RESOURCE_PACK_CLIENT_RESPONSE: u32 = 0x08;
    pub const TEXT: u32 = 0x09;
    pub const START_GAME: u32 = 0x0b;
    pub const MOVE_PLAYER: u32 = 0x13;
    pub const INVENTORY_TRANSACTION: u32 = 0x1e;
    pub const INTERACT: u32 = 0x21;
    pub const BLOCK_PICK_REQUEST: u32 = 0x22;
    pub const PLAYER_ACTION: u32 = 0x24;
    pub const ANIMATE: u32 = 0x2c;
    pub const CONTAINER_CLOSE: u32 = 0x2f;
    pub const PLAYER_HOTBAR: u32 = 0x30;
    pub const CRAFTING_EVENT: u32 = 0x35;
    pub const BLOCK_ACTOR_DATA: u32 = 0x38;
    pub const LEVEL_CHUNK: u32 = 0x3a;
    pub const REQUEST_CHUNK_RADIUS: u32 = 0x45;
    pub const AVAILABLE_COMMANDS: u32 = 0x4c;
    pub const COMMAND_REQUEST: u32 = 0x4d;
    pub const RESOURCE_PACK_DATA_INFO: u32 = 0x52;
    pub const RESOURCE_PACK_CHUNK_DATA: u32 = 0x53;
    pub const RESOURCE_PACK_CHUNK_REQUEST: u32 = 0x54;
    pub const TRANSFER: u32 = 0x55;
    pub const SET_TITLE: u32 = 0x58;
    pub const MODAL_FORM_REQUEST: u32 = 0x64;
    pub const MODAL_FORM_RESPONSE: u32 = 0x65;
    pub const SET_LOCAL_PLAYER_AS_INITIALIZED: u32 = 0x71;
    pub const NETWORK_STACK_LATENCY: u32 = 0x73;
    pub const NETWORK_CHUNK_PUBLISHER_UPDATE: u32 = 0x79;
    pub const LEVEL_SOUND_EVENT: u32 = 0x7b;
    pub const CLIENT_CACHE_STATUS: u32 = 0x81;
    pub const EMOTE: u32 = 0x8a;
    pub const SETTINGS_COMMAND: u32 = 0x8c;
    pub const NETWORK_SETTINGS: u32 = 0x8f;
    pub const PLAYER_AUTH_INPUT: u32 = 0x90;
    pub const ITEM_STACK_REQUEST: u32 = 0x93;
    pub const TOAST_REQUEST: u32 = 0xba;
    pub const REQUEST_NETWORK_SETTINGS: u32 = 0xc1;
    pub const CLIENTBOUND_CLOSE_FORM: u32 = 0x136;
}

const PACKET_ID_MASK: u32 = 0x3ff;

/// A packet whose body the relay does not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPacket {
    pub id: u32,
    pub body: Bytes,
}

#[derive(Debug, Clone, FromVariants, strum::AsRefStr)]
pub enum GamePacket {
    RequestNetworkSettings(RequestNetworkSettings),
    NetworkSettings(NetworkSettings),
    Login(Login),
    PlayStatus(PlayStatus),
    Disconnect(Disconnect),
    ResourcePacksInfo(ResourcePacksInfo),
    ResourcePackStack(ResourcePackStack),
    ResourcePackClientResponse(ResourcePackClientResponse),
    ResourcePackDataInfo(ResourcePackDataInfo),
    ResourcePackChunkData(ResourcePackChunkData),
    ResourcePackChunkRequest(ResourcePackChunkRequest),
    ClientCacheStatus(ClientCacheStatus),
    StartGame(StartGame),
    RequestChunkRadius(RequestChunkRadius),
    LevelChunk(LevelChunk),
    NetworkChunkPublisherUpdate(NetworkChunkPublisherUpdate),
    Transfer(Transfer),
    AvailableCommands(AvailableCommands),
    CommandRequest(CommandRequest),
    Text(Text),
    SetTitle(SetTitle),
    ToastRequest(ToastRequest),
    ModalFormRequest(ModalFormRequest),
    ModalFormResponse(ModalFormResponse),
    ClientboundCloseForm(ClientboundCloseForm),
    Unknown(UnknownPacket),
}

impl GamePacket {
    pub fn id(&self) -> u32 {
        match self {
            GamePacket::RequestNetworkSettings(_) => id::REQUEST_NETWORK_SETTINGS,
            GamePacket::NetworkSettings(_) => id::NETWORK_SETTINGS,
            GamePacket::Login(_) => id::LOGIN,
            GamePacket::PlayStatus(_) => id::PLAY_STATUS,
            GamePacket::Disconnect(_) => id::DISCONNECT,
            GamePacket::ResourcePacksInfo(_) => id::RESOURCE_PACKS_INFO,
            GamePacket::ResourcePackStack(_) => id::RESOURCE_PACK_STACK,
            GamePacket::ResourcePackClientResponse(_) => id::RESOURCE_PACK_CLIENT_RESPONSE,
            GamePacket::ResourcePackDataInfo(_) => id::RESOURCE_PACK_DATA_INFO,
            GamePacket::ResourcePackChunkData(_) => id::RESOURCE_PACK_CHUNK_DATA,
            GamePacket::ResourcePackChunkRequest(_) => id::RESOURCE_PACK_CHUNK_REQUEST,
            GamePacket::ClientCacheStatus(_) => id::CLIENT_CACHE_STATUS,
            GamePacket::StartGame(_) => id::START_GAME,
            GamePacket::RequestChunkRadius(_) => id::REQUEST_CHUNK_RADIUS,
            GamePacket::LevelChunk(_) => id::LEVEL_CHUNK,
            GamePacket::NetworkChunkPublisherUpdate(_) => id::NETWORK_CHUNK_PUBLISHER_UPDATE,
            GamePacket::Transfer(_) => id::TRANSFER,
            GamePacket::AvailableCommands(_) => id::AVAILABLE_COMMANDS,
            GamePacket::CommandRequest(_) => id::COMMAND_REQUEST,
            GamePacket::Text(_) => id::TEXT,
            GamePacket::SetTitle(_) => id::SET_TITLE,
            GamePacket::ToastRequest(_) => id::TOAST_REQUEST,
            GamePacket::ModalFormRequest(_) => id::MODAL_FORM_REQUEST,
            GamePacket::ModalFormResponse(_) => id::MODAL_FORM_RESPONSE,
            GamePacket::ClientboundCloseForm(_) => id::CLIENTBOUND_CLOSE_FORM,
            GamePacket::Unknown(packet) => packet.id,
        }
    }

    /// Reads the packet id from a serialized packet without decoding it.
    pub fn peek_id(buffer: &[u8]) -> Result<u32, DecodeError> {
        Ok(Decoder::new(buffer).read_var_uint()? & PACKET_ID_MASK)
    }

    /// Decodes one serialized packet (header included).
    pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(buffer);
        let packet_id = decoder.read_var_uint()? & PACKET_ID_MASK;
        let decoder = &mut decoder;
        let packet: GamePacket = match packet_id {
            id::REQUEST_NETWORK_SETTINGS => RequestNetworkSettings::decode(decoder)?.into(),
            id::NETWORK_SETTINGS => NetworkSettings::decode(decoder)?.into(),
            id::LOGIN => Login::decode(decoder)?.into(),
            id::PLAY_STATUS => PlayStatus::decode(decoder)?.into(),
            id::DISCONNECT => Disconnect::decode(decoder)?.into(),
            id::RESOURCE_PACK_CLIENT_RESPONSE => ResourcePackClientResponse::decode(decoder)?.into(),
            id::RESOURCE_PACK_CHUNK_REQUEST => ResourcePackChunkRequest::decode(decoder)?.into(),
            id::CLIENT_CACHE_STATUS => ClientCacheStatus::decode(decoder)?.into(),
            id::START_GAME => StartGame::decode(decoder)?.into(),
            id::REQUEST_CHUNK_RADIUS => RequestChunkRadius::decode(decoder)?.into(),
            id::TRANSFER => Transfer::decode(decoder)?.into(),
            id::COMMAND_REQUEST => CommandRequest::decode(decoder)?.into(),
            id::MODAL_FORM_RESPONSE => ModalFormResponse::decode(decoder)?.into(),
            _ => UnknownPacket {
                id: packet_id,
                body: Bytes::copy_from_slice(decoder.consume_rest()),
            }
            .into(),
        };
        Ok(packet)
    }

    /// Serializes the packet, header included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut Encoder::new(&mut buf));
        buf
    }
}

impl Encode for GamePacket {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_var_uint(self.id());
        match self {
            GamePacket::RequestNetworkSettings(p) => p.encode(encoder),
            GamePacket::NetworkSettings(p) => p.encode(encoder),
            GamePacket::Login(p) => p.encode(encoder),
            GamePacket::PlayStatus(p) => p.encode(encoder),
            GamePacket::Disconnect(p) => p.encode(encoder),
            GamePacket::ResourcePacksInfo(p) => p.encode(encoder),
            GamePacket::ResourcePackStack(p) => p.encode(encoder),
            GamePacket::ResourcePackClientResponse(p) => p.encode(encoder),
            GamePacket::ResourcePackDataInfo(p) => p.encode(encoder),
            GamePacket::ResourcePackChunkData(p) => p.encode(encoder),
            GamePacket::ResourcePackChunkRequest(p) => p.encode(encoder),
            GamePacket::ClientCacheStatus(p) => p.encode(encoder),
            GamePacket::StartGame(p) => p.encode(encoder),
            GamePacket::RequestChunkRadius(p) => p.encode(encoder),
            GamePacket::LevelChunk(p) => p.encode(encoder),
            GamePacket::NetworkChunkPublisherUpdate(p) => p.encode(encoder),
            GamePacket::Transfer(p) => p.encode(encoder),
            GamePacket::AvailableCommands(p) => p.encode(encoder),
            GamePacket::CommandRequest(p) => p.encode(encoder),
            GamePacket::Text(p) => p.encode(encoder),
            GamePacket::SetTitle(p) => p.encode(encoder),
            GamePacket::ToastRequest(p) => p.encode(encoder),
            GamePacket::ModalFormRequest(p) => p.encode(encoder),
            GamePacket::ModalFormResponse(p) => p.encode(encoder),
            GamePacket::ClientboundCloseForm(p) => p.encode(encoder),
            GamePacket::Unknown(p) => encoder.write_slice(&p.body),
        }
    }
}
