//! Packet batches: the unit carried by one game payload.
//!
//! A batch is a run of `[varuint length][packet bytes]` entries. A payload
//! that starts with [`RAW_PACKET_SENTINEL`] is a single packet instead.

use crate::protocol::{DecodeError, Decoder, Encoder};

/// Id of RequestNetworkSettings, the only packet a client sends unbatched.
pub const RAW_PACKET_SENTINEL: u8 = 0xC1;

/// Encodes already-serialized packets into one batch.
pub fn encode_batch<'a>(packets: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut encoder = Encoder::new(&mut buf);
    for packet in packets {
        encoder.write_byte_array(packet);
    }
    buf
}

/// What a decompressed payload contains.
#[derive(Debug)]
pub enum Payload<'a> {
    Single(&'a [u8]),
    Batch(BatchReader<'a>),
}

impl<'a> Payload<'a> {
    pub fn parse(data: &'a [u8]) -> Self {
        match data.first() {
            Some(&RAW_PACKET_SENTINEL) => Payload::Single(data),
            _ => Payload::Batch(BatchReader::new(data)),
        }
    }

    /// Iterates over the packet buffers, stopping after the first
    /// malformed length prefix.
    pub fn packets(self) -> impl Iterator<Item = Result<&'a [u8], DecodeError>> {
        let (single, batch) = match self {
            Payload::Single(packet) => (Some(Ok(packet)), None),
            Payload::Batch(reader) => (None, Some(reader)),
        };
        single.into_iter().chain(batch.into_iter().flatten())
    }
}

/// Iterator over the entries of a batch.
///
/// Yields `Err` once on a truncated or corrupt length prefix, then ends.
#[derive(Debug)]
pub struct BatchReader<'a> {
    decoder: Decoder<'a>,
    failed: bool,
}

impl<'a> BatchReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            decoder: Decoder::new(data),
            failed: false,
        }
    }
}

impl<'a> Iterator for BatchReader<'a> {
    type Item = Result<&'a [u8], DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.decoder.is_finished() {
            return None;
        }
        match self.decoder.read_byte_array() {
            Ok(packet) => Some(Ok(packet)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
