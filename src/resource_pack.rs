//! Resource packs offered to clients during login.
//!
//! Pack storage sits behind [`PackStore`]; the login handler only needs
//! pack metadata, chunk counts and chunk bytes.

use crate::{
    config::ResourcePackConfig,
    protocol::{
        packet::{
            resource_pack::{ResourcePackInfoEntry, ResourcePackStackEntry},
            ResourcePackChunkData, ResourcePackDataInfo, ResourcePackStack, ResourcePacksInfo,
        },
        CURRENT_PROTOCOL,
    },
};
use ahash::AHashMap;
use bytes::Bytes;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use uuid::Uuid;

/// Bytes per pack chunk.
pub const CHUNK_SIZE: usize = 102_400;

/// Number of chunks needed to transfer `size` bytes.
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64).try_into().unwrap_or(u32::MAX)
}

#[derive(Debug, Clone)]
pub struct ResourcePack {
    pub uuid: Uuid,
    pub version: String,
    /// The packaged pack archive.
    pub data: Bytes,
    pub sha256: Bytes,
    /// Behavior pack rather than resource pack.
    pub is_addon: bool,
}

impl ResourcePack {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

pub trait PackStore: Send + Sync {
    fn packs(&self) -> Vec<Arc<ResourcePack>>;

    fn pack(&self, id: &str) -> Option<Arc<ResourcePack>>;

    fn chunk_count(&self, id: &str) -> Option<u32> {
        self.pack(id).map(|pack| chunk_count(pack.size()))
    }

    /// Bytes of chunk `index`, or `None` for an unknown pack or an index
    /// past the end.
    fn chunk(&self, id: &str, index: u32) -> Option<Bytes> {
        let pack = self.pack(id)?;
        let start = usize::try_from(index).ok()?.checked_mul(CHUNK_SIZE)?;
        if start >= pack.data.len() {
            return None;
        }
        let end = (start + CHUNK_SIZE).min(pack.data.len());
        Some(pack.data.slice(start..end))
    }
}

/// Packs held in memory, keyed by lowercase UUID.
#[derive(Debug, Default)]
pub struct MemoryPackStore {
    packs: Vec<Arc<ResourcePack>>,
    by_id: AHashMap<String, Arc<ResourcePack>>,
}

impl MemoryPackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pack. Returns `false` if a pack with the same UUID exists.
    pub fn add(&mut self, pack: ResourcePack) -> bool {
        let key = pack.uuid.to_string();
        if self.by_id.contains_key(&key) {
            tracing::warn!("Duplicate resource pack {key}, skipping");
            return false;
        }
        let pack = Arc::new(pack);
        self.by_id.insert(key, pack.clone());
        self.packs.push(pack);
        true
    }

    /// Loads every `<uuid>_<version>.mcpack` (or `.zip`) archive in `dir`.
    /// Files not following that naming are skipped with a warning.
    pub fn load_dir(dir: &Path) -> io::Result<Self> {
        let mut store = Self::new();
        if !dir.exists() {
            fs_err::create_dir_all(dir)?;
            return Ok(store);
        }
        let mut paths: Vec<PathBuf> = fs_err::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("mcpack") || ext.eq_ignore_ascii_case("zip"))
            })
            .collect();
        paths.sort();

        for path in paths {
            let Some((uuid, version)) = parse_pack_file_name(&path) else {
                tracing::warn!("Skipping {}: expected <uuid>_<version> file name", path.display());
                continue;
            };
            let data = fs_err::read(&path)?;
            store.add(ResourcePack {
                uuid,
                version,
                data: Bytes::from(data),
                sha256: Bytes::new(),
                is_addon: false,
            });
        }
        Ok(store)
    }
}

fn parse_pack_file_name(path: &Path) -> Option<(Uuid, String)> {
    let stem = path.file_stem()?.to_str()?;
    let (uuid, version) = stem.split_once('_')?;
    let uuid = Uuid::parse_str(uuid).ok()?;
    (!version.is_empty()).then(|| (uuid, version.to_owned()))
}

impl PackStore for MemoryPackStore {
    fn packs(&self) -> Vec<Arc<ResourcePack>> {
        self.packs.clone()
    }

    fn pack(&self, id: &str) -> Option<Arc<ResourcePack>> {
        // Clients may send `uuid_version`.
        let uuid = id.split_once('_').map_or(id, |(uuid, _)| uuid);
        self.by_id.get(&uuid.to_lowercase()).cloned()
    }
}

/// Builds the resource pack packets from a store and the pack settings.
pub struct ResourcePackManager {
    store: Box<dyn PackStore>,
    settings: ResourcePackConfig,
}

impl ResourcePackManager {
    pub fn new(store: Box<dyn PackStore>, settings: ResourcePackConfig) -> Self {
        if settings.enabled {
            tracing::info!("Loaded {} resource packs", store.packs().len());
        }
        Self { store, settings }
    }

    pub fn disabled() -> Self {
        Self::new(Box::new(MemoryPackStore::new()), ResourcePackConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn is_force_accept(&self) -> bool {
        self.settings.force_accept
    }

    pub fn store(&self) -> &dyn PackStore {
        self.store.as_ref()
    }

    pub fn info_packet(&self) -> ResourcePacksInfo {
        if !self.is_enabled() {
            return ResourcePacksInfo::empty();
        }
        let packs = self.store.packs();
        let mut info = ResourcePacksInfo::empty();
        info.must_accept = self.settings.force_accept;
        info.has_addons = packs.iter().any(|p| p.is_addon);
        info.resource_packs = packs
            .iter()
            .map(|pack| ResourcePackInfoEntry {
                pack_id: pack.uuid,
                version: pack.version.clone(),
                size_bytes: pack.size(),
                encryption_key: String::new(),
                sub_pack_name: String::new(),
                content_id: String::new(),
                has_scripts: false,
                is_addon_pack: pack.is_addon,
                is_rtx_capable: false,
                cdn_url: String::new(),
            })
            .collect();
        info
    }

    pub fn stack_packet(&self) -> ResourcePackStack {
        let mut stack = ResourcePackStack::empty();
        if !self.is_enabled() {
            return stack;
        }
        stack.must_accept = self.settings.force_accept;
        stack.base_game_version = crate::protocol::protocol_version_name(CURRENT_PROTOCOL)
            .unwrap_or("*")
            .to_owned();
        stack.resource_packs = self
            .store
            .packs()
            .iter()
            .map(|pack| ResourcePackStackEntry {
                pack_id: pack.uuid.to_string(),
                version: pack.version.clone(),
                sub_pack_name: String::new(),
            })
            .collect();
        stack
    }

    pub fn data_info(&self, id: &str) -> Option<ResourcePackDataInfo> {
        let pack = self.store.pack(id)?;
        Some(ResourcePackDataInfo {
            pack_id: pack.uuid.to_string(),
            max_chunk_size: CHUNK_SIZE as u32,
            chunk_count: self.store.chunk_count(id)?,
            compressed_pack_size: pack.size(),
            sha256: pack.sha256.clone(),
            is_premium: false,
            pack_type: if pack.is_addon {
                ResourcePackDataInfo::TYPE_ADDON
            } else {
                ResourcePackDataInfo::TYPE_RESOURCES
            },
        })
    }

    pub fn chunk_data(&self, id: &str, index: u32) -> Option<ResourcePackChunkData> {
        let pack = self.store.pack(id)?;
        let data = self.store.chunk(id, index)?;
        Some(ResourcePackChunkData {
            pack_id: pack.uuid.to_string(),
            chunk_index: index,
            offset: u64::from(index) * CHUNK_SIZE as u64,
            data,
        })
    }
}
