//! Resource pack negotiation packets.

use aquarelay_macros::{Decode, Encode};
use bytes::Bytes;
use uuid::Uuid;

#[derive(Debug, Clone, Encode, Decode)]
pub struct ResourcePacksInfo {
    pub must_accept: bool,
    pub has_addons: bool,
    pub has_scripts: bool,
    pub force_disable_vibrant_visuals: bool,
    pub world_template_id: Uuid,
    pub world_template_version: String,
    #[encoding(length_prefix = "u16")]
    pub resource_packs: Vec<ResourcePackInfoEntry>,
}

impl ResourcePacksInfo {
    /// Manifest advertising no packs at all.
    pub fn empty() -> Self {
        Self {
            must_accept: false,
            has_addons: false,
            has_scripts: false,
            force_disable_vibrant_visuals: true,
            world_template_id: Uuid::nil(),
            world_template_version: String::new(),
            resource_packs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ResourcePackInfoEntry {
    pub pack_id: Uuid,
    pub version: String,
    pub size_bytes: u64,
    pub encryption_key: String,
    pub sub_pack_name: String,
    pub content_id: String,
    pub has_scripts: bool,
    pub is_addon_pack: bool,
    pub is_rtx_capable: bool,
    pub cdn_url: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ResourcePackStack {
    pub must_accept: bool,
    #[encoding(length_prefix = "varuint")]
    pub resource_packs: Vec<ResourcePackStackEntry>,
    pub base_game_version: String,
    pub experiments: Experiments,
    pub use_vanilla_editor_packs: bool,
}

impl ResourcePackStack {
    pub fn empty() -> Self {
        Self {
            must_accept: false,
            resource_packs: Vec::new(),
            base_game_version: "*".to_owned(),
            experiments: Experiments::default(),
            use_vanilla_editor_packs: false,
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ResourcePackStackEntry {
    pub pack_id: String,
    pub version: String,
    pub sub_pack_name: String,
}

#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct Experiments {
    #[encoding(length_prefix = "u32")]
    pub entries: Vec<Experiment>,
    pub previously_toggled: bool,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Experiment {
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, strum::AsRefStr)]
#[encoding(discriminant = "byte")]
pub enum ResponseStatus {
    #[encoding(id = 1)]
    Refused,
    #[encoding(id = 2)]
    SendPacks,
    #[encoding(id = 3)]
    HaveAllPacks,
    #[encoding(id = 4)]
    Completed,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ResourcePackClientResponse {
    pub status: ResponseStatus,
    #[encoding(length_prefix = "u16")]
    pub pack_ids: Vec<String>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ResourcePackDataInfo {
    pub pack_id: String,
    pub max_chunk_size: u32,
    pub chunk_count: u32,
    pub compressed_pack_size: u64,
    pub sha256: Bytes,
    pub is_premium: bool,
    pub pack_type: u8,
}

impl ResourcePackDataInfo {
    pub const TYPE_ADDON: u8 = 1;
    pub const TYPE_RESOURCES: u8 = 6;
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ResourcePackChunkData {
    pub pack_id: String,
    pub chunk_index: u32,
    pub offset: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ResourcePackChunkRequest {
    pub pack_id: String,
    pub chunk_index: u32,
}
