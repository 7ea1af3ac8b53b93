use aquarelay_macros::{Decode, Encode};

#[derive(Debug, Clone, Encode, Decode)]
pub struct ClientCacheStatus {
    pub enabled: bool,
}

/// Only the entity ids are decoded; the rest of the (large) packet is
/// carried verbatim.
#[derive(Debug, Clone, Encode, Decode)]
pub struct StartGame {
    #[encoding(varlong)]
    pub actor_unique_id: i64,
    #[encoding(varulong)]
    pub actor_runtime_id: u64,
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct RequestChunkRadius {
    #[encoding(varint)]
    pub radius: i32,
    pub max_radius: u8,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Transfer {
    pub address: String,
    pub port: u16,
    pub reload_world: bool,
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct BlockPosition {
    #[encoding(varint)]
    pub x: i32,
    #[encoding(varuint)]
    pub y: u32,
    #[encoding(varint)]
    pub z: i32,
}

#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct ChunkPosition {
    #[encoding(varint)]
    pub x: i32,
    #[encoding(varint)]
    pub z: i32,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct NetworkChunkPublisherUpdate {
    pub position: BlockPosition,
    #[encoding(varuint)]
    pub radius: u32,
    #[encoding(length_prefix = "u32")]
    pub saved_chunks: Vec<ChunkPosition>,
}

/// A full-chunk LevelChunk without sub-chunk requests or blob caching.
#[derive(Debug, Clone, Encode, Decode)]
pub struct LevelChunk {
    pub position: ChunkPosition,
    #[encoding(varint)]
    pub dimension_id: i32,
    #[encoding(varuint)]
    pub sub_chunk_count: u32,
    pub cache_enabled: bool,
    pub payload: bytes::Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::GamePacket;

    #[test]
    fn start_game_keeps_tail() {
        let packet = StartGame {
            actor_unique_id: -5,
            actor_runtime_id: 300,
            ignored_data: vec![9, 8, 7],
        };
        let bytes = GamePacket::StartGame(packet).to_bytes();
        assert_eq!(bytes, [0x0b, 0x09, 0xac, 0x02, 9, 8, 7]);
        match GamePacket::decode(&bytes).unwrap() {
            GamePacket::StartGame(decoded) => {
                assert_eq!(decoded.actor_unique_id, -5);
                assert_eq!(decoded.actor_runtime_id, 300);
                assert_eq!(decoded.ignored_data, [9, 8, 7]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn transfer_port_is_little_endian() {
        let packet = Transfer {
            address: "a".to_owned(),
            port: 19132,
            reload_world: false,
        };
        let bytes = GamePacket::Transfer(packet).to_bytes();
        assert_eq!(bytes, [0x55, 0x01, b'a', 0xbc, 0x4a, 0x00]);
    }
}
