use super::{RakNetError, SplitInfo};
use crate::protocol::compression::DEFAULT_MAX_DECOMPRESSED;
use ahash::AHashMap;
use bytes::{Bytes, BytesMut};

/// Largest number of split packets being reassembled at once.
const MAX_CONCURRENT_SPLITS: usize = 16;

#[derive(Debug)]
struct PartialPacket {
    count: u32,
    parts: AHashMap<u32, Bytes>,
    size: usize,
}

/// Reassembles split frames by split id.
///
/// The part count a peer declares is only trusted as far as the byte
/// budget: parts are stored as they arrive, and a split whose buffered
/// bytes would pass `max_bytes` is dropped. Every pending split shares
/// the same budget.
#[derive(Debug)]
pub struct SplitAssembler {
    pending: AHashMap<u16, PartialPacket>,
    max_bytes: usize,
    buffered: usize,
}

impl Default for SplitAssembler {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_DECOMPRESSED)
    }
}

impl SplitAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            pending: AHashMap::new(),
            max_bytes,
            buffered: 0,
        }
    }

    /// Stores one part. Returns the whole payload, concatenated in index
    /// order, once every part of its split id has arrived.
    ///
    /// On error the part is not stored; a split that ran over the byte
    /// budget is forgotten entirely.
    pub fn insert(&mut self, split: SplitInfo, payload: Bytes) -> Result<Option<Bytes>, RakNetError> {
        let SplitInfo { count, id, index } = split;
        let invalid = RakNetError::InvalidSplit { id, index, count };
        // Every part carries at least one byte.
        let too_many_parts = usize::try_from(count).map_or(true, |count| count > self.max_bytes);
        if count == 0 || index >= count || too_many_parts {
            return Err(invalid);
        }
        if !self.pending.contains_key(&id) && self.pending.len() >= MAX_CONCURRENT_SPLITS {
            return Err(RakNetError::TooManySplits);
        }

        let partial = self.pending.entry(id).or_insert_with(|| PartialPacket {
            count,
            parts: AHashMap::new(),
            size: 0,
        });
        if partial.count != count {
            return Err(invalid);
        }
        if partial.parts.contains_key(&index) {
            return Ok(None);
        }
        if self.buffered + payload.len() > self.max_bytes {
            self.discard(id);
            return Err(RakNetError::SplitTooLarge {
                id,
                limit: self.max_bytes,
            });
        }
        partial.size += payload.len();
        self.buffered += payload.len();
        partial.parts.insert(index, payload);
        if partial.parts.len() < partial.count as usize {
            return Ok(None);
        }

        let Some(mut partial) = self.discard(id) else {
            return Ok(None);
        };
        let mut whole = BytesMut::with_capacity(partial.size);
        for index in 0..partial.count {
            if let Some(part) = partial.parts.remove(&index) {
                whole.extend_from_slice(&part);
            }
        }
        Ok(Some(whole.freeze()))
    }

    fn discard(&mut self, id: u16) -> Option<PartialPacket> {
        let partial = self.pending.remove(&id)?;
        self.buffered -= partial.size;
        Some(partial)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Bytes held by incomplete splits.
    pub fn buffered(&self) -> usize {
        self.buffered
    }
}

/// Cuts a payload into chunks of at most `max_chunk` bytes.
pub fn fragment(payload: &[u8], max_chunk: usize) -> Vec<Bytes> {
    payload
        .chunks(max_chunk.max(1))
        .map(Bytes::copy_from_slice)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(payload: &[u8]) -> Vec<(SplitInfo, Bytes)> {
        let chunks = fragment(payload, 100);
        let count = chunks.len() as u32;
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let info = SplitInfo {
                    count,
                    id: 4,
                    index: index as u32,
                };
                (info, chunk)
            })
            .collect()
    }

    #[test]
    fn reassembles_in_any_order() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        let orders: [&[usize]; 3] = [
            &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9],
            &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0],
            &[3, 0, 9, 5, 1, 8, 2, 7, 4, 6],
        ];
        for order in orders {
            let parts = parts(&payload);
            assert_eq!(parts.len(), 10);
            let mut assembler = SplitAssembler::new();
            let mut result = None;
            for &i in order {
                let (info, chunk) = parts[i].clone();
                assert!(result.is_none());
                result = assembler.insert(info, chunk).unwrap();
            }
            assert_eq!(result.as_deref(), Some(&payload[..]));
            assert_eq!(assembler.pending(), 0);
        }
    }

    #[test]
    fn duplicate_parts_are_ignored() {
        let payload = [1u8; 250];
        let parts = parts(&payload);
        let mut assembler = SplitAssembler::new();
        assert!(assembler.insert(parts[0].0, parts[0].1.clone()).unwrap().is_none());
        assert!(assembler.insert(parts[0].0, parts[0].1.clone()).unwrap().is_none());
        assert!(assembler.insert(parts[1].0, parts[1].1.clone()).unwrap().is_none());
        let whole = assembler.insert(parts[2].0, parts[2].1.clone()).unwrap();
        assert_eq!(whole.as_deref(), Some(&payload[..]));
    }

    #[test]
    fn rejects_invalid_headers() {
        let mut assembler = SplitAssembler::new();
        let part = Bytes::from_static(b"x");
        let zero = SplitInfo { count: 0, id: 1, index: 0 };
        let past_end = SplitInfo { count: 2, id: 1, index: 2 };
        assert!(assembler.insert(zero, part.clone()).is_err());
        assert!(assembler.insert(past_end, part.clone()).is_err());

        let first = SplitInfo { count: 2, id: 1, index: 0 };
        let mismatch = SplitInfo { count: 3, id: 1, index: 1 };
        assert!(assembler.insert(first, part.clone()).unwrap().is_none());
        assert!(assembler.insert(mismatch, part).is_err());
    }

    #[test]
    fn limits_concurrent_splits() {
        let mut assembler = SplitAssembler::new();
        let part = Bytes::from_static(b"x");
        for id in 0..MAX_CONCURRENT_SPLITS as u16 {
            let info = SplitInfo { count: 2, id, index: 0 };
            assert!(assembler.insert(info, part.clone()).unwrap().is_none());
        }
        let info = SplitInfo { count: 2, id: 99, index: 0 };
        assert!(matches!(
            assembler.insert(info, part),
            Err(RakNetError::TooManySplits)
        ));
    }

    #[test]
    fn accepts_more_parts_than_fit_a_small_mtu() {
        let payload: Vec<u8> = (0..60_000u32).map(|i| (i % 253) as u8).collect();
        let parts = parts(&payload);
        assert_eq!(parts.len(), 600);
        let mut assembler = SplitAssembler::new();
        let mut result = None;
        for (info, chunk) in parts.into_iter().rev() {
            assert!(result.is_none());
            result = assembler.insert(info, chunk).unwrap();
        }
        assert_eq!(result.as_deref(), Some(&payload[..]));
        assert_eq!(assembler.buffered(), 0);
    }

    #[test]
    fn huge_part_count_allocates_nothing_up_front() {
        let mut assembler = SplitAssembler::with_limit(1000);
        let part = Bytes::from_static(b"x");
        let absurd = SplitInfo { count: u32::MAX, id: 1, index: 0 };
        assert!(assembler.insert(absurd, part.clone()).is_err());
        assert_eq!(assembler.pending(), 0);

        let plausible = SplitInfo { count: 1000, id: 1, index: 0 };
        assert!(assembler.insert(plausible, part).unwrap().is_none());
        assert_eq!(assembler.buffered(), 1);
    }

    #[test]
    fn split_over_the_byte_limit_is_dropped() {
        let mut assembler = SplitAssembler::with_limit(250);
        let payload = [7u8; 300];
        let parts = parts(&payload);
        assert!(assembler.insert(parts[0].0, parts[0].1.clone()).unwrap().is_none());
        assert!(assembler.insert(parts[1].0, parts[1].1.clone()).unwrap().is_none());
        assert!(matches!(
            assembler.insert(parts[2].0, parts[2].1.clone()),
            Err(RakNetError::SplitTooLarge { id: 4, limit: 250 })
        ));
        assert_eq!(assembler.pending(), 0);
        assert_eq!(assembler.buffered(), 0);

        // The budget is free again for the next split.
        let small = [1u8; 150];
        let small_parts = self::parts(&small);
        assert!(assembler.insert(small_parts[0].0, small_parts[0].1.clone()).unwrap().is_none());
        let whole = assembler.insert(small_parts[1].0, small_parts[1].1.clone()).unwrap();
        assert_eq!(whole.as_deref(), Some(&small[..]));
    }
}
