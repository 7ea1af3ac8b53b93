//! Frame sets and acknowledgement datagrams.

use super::{id, DatagramFlags, RakNetError, Reliability};
use crate::protocol::{Decoder, Encoder};
use bytes::Bytes;

const SPLIT_FLAG: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

/// One encapsulated message inside a frame set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reliability: Reliability,
    pub message_index: Option<u32>,
    pub sequence_index: Option<u32>,
    /// Order index and channel.
    pub order: Option<(u32, u8)>,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl Frame {
    /// Size of the frame header preceding the payload.
    pub fn header_len(&self) -> usize {
        let mut len = 3;
        if self.reliability.is_reliable() {
            len += 3;
        }
        if self.reliability.is_sequenced() {
            len += 3;
        }
        if self.reliability.is_ordered() {
            len += 4;
        }
        if self.split.is_some() {
            len += 10;
        }
        len
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        let mut flags = (self.reliability as u8) << 5;
        if self.split.is_some() {
            flags |= SPLIT_FLAG;
        }
        encoder.write_u8(flags);
        let bits = self.payload.len().saturating_mul(8);
        encoder.write_u16(bits.try_into().unwrap_or(u16::MAX));

        if self.reliability.is_reliable() {
            encoder.write_u24_le(self.message_index.unwrap_or_default());
        }
        if self.reliability.is_sequenced() {
            encoder.write_u24_le(self.sequence_index.unwrap_or_default());
        }
        if self.reliability.is_ordered() {
            let (index, channel) = self.order.unwrap_or_default();
            encoder.write_u24_le(index);
            encoder.write_u8(channel);
        }
        if let Some(split) = &self.split {
            encoder.write_u32(split.count);
            encoder.write_u16(split.id);
            encoder.write_u32(split.index);
        }
        encoder.write_slice(&self.payload);
    }

    pub fn decode(decoder: &mut Decoder) -> Result<Self, RakNetError> {
        let flags = decoder.read_u8()?;
        let reliability = Reliability::from_bits(flags >> 5)?;
        let length = usize::from(decoder.read_u16()?).div_ceil(8);

        let message_index = if reliability.is_reliable() {
            Some(decoder.read_u24_le()?)
        } else {
            None
        };
        let sequence_index = if reliability.is_sequenced() {
            Some(decoder.read_u24_le()?)
        } else {
            None
        };
        let order = if reliability.is_ordered() {
            Some((decoder.read_u24_le()?, decoder.read_u8()?))
        } else {
            None
        };
        let split = if flags & SPLIT_FLAG != 0 {
            Some(SplitInfo {
                count: decoder.read_u32()?,
                id: decoder.read_u16()?,
                index: decoder.read_u32()?,
            })
        } else {
            None
        };
        let payload = Bytes::copy_from_slice(decoder.consume_slice(length)?);

        Ok(Self {
            reliability,
            message_index,
            sequence_index,
            order,
            split,
            payload,
        })
    }
}

/// A frame set: sequence number plus the frames it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub sequence: u32,
    pub frames: Vec<Frame>,
}

impl Datagram {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut encoder = Encoder::new(&mut buf);
        encoder.write_u8(DatagramFlags::FRAME_SET.bits());
        encoder.write_u24_le(self.sequence);
        for frame in &self.frames {
            frame.encode(&mut encoder);
        }
        buf
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, RakNetError> {
        let mut decoder = Decoder::new(buffer);
        let flags = decoder.read_u8()?;
        let parsed = DatagramFlags::from_bits_truncate(flags);
        if !parsed.contains(DatagramFlags::VALID)
            || parsed.intersects(DatagramFlags::ACK | DatagramFlags::NACK)
        {
            return Err(RakNetError::UnexpectedMessage(flags));
        }
        let sequence = decoder.read_u24_le()?;
        let mut frames = Vec::new();
        while !decoder.is_finished() {
            frames.push(Frame::decode(&mut decoder)?);
        }
        Ok(Self { sequence, frames })
    }
}

/// An inclusive range of acknowledged (or missing) sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRecord {
    pub first: u32,
    pub last: u32,
}

impl AckRecord {
    pub fn single(sequence: u32) -> Self {
        Self {
            first: sequence,
            last: sequence,
        }
    }

    pub fn contains(&self, sequence: u32) -> bool {
        (self.first..=self.last).contains(&sequence)
    }

    /// Collapses sorted sequence numbers into ranges.
    pub fn from_sorted(sequences: &[u32]) -> Vec<Self> {
        let mut records: Vec<AckRecord> = Vec::new();
        for &sequence in sequences {
            match records.last_mut() {
                Some(record) if record.last.wrapping_add(1) == sequence => record.last = sequence,
                _ => records.push(Self::single(sequence)),
            }
        }
        records
    }

    /// Encodes an ACK (`id::ACK`) or NACK (`id::NACK`) datagram.
    pub fn encode_all(message_id: u8, records: &[AckRecord]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut encoder = Encoder::new(&mut buf);
        encoder.write_u8(message_id);
        encoder.write_u16(records.len().try_into().unwrap_or(u16::MAX));
        for record in records {
            if record.first == record.last {
                encoder.write_u8(1);
                encoder.write_u24_le(record.first);
            } else {
                encoder.write_u8(0);
                encoder.write_u24_le(record.first);
                encoder.write_u24_le(record.last);
            }
        }
        buf
    }

    /// Decodes an ACK or NACK datagram, message id included.
    pub fn decode_all(buffer: &[u8]) -> Result<Vec<AckRecord>, RakNetError> {
        let mut decoder = Decoder::new(buffer);
        let message_id = decoder.read_u8()?;
        if message_id & (id::ACK | id::NACK) == 0 {
            return Err(RakNetError::UnexpectedMessage(message_id));
        }
        let count = decoder.read_u16()?;
        let mut records = Vec::with_capacity(usize::from(count).min(buffer.len()));
        for _ in 0..count {
            let single = decoder.read_bool()?;
            let first = decoder.read_u24_le()?;
            let last = if single { first } else { decoder.read_u24_le()? };
            records.push(AckRecord { first, last });
        }
        Ok(records)
    }
}
