//! Compression of game payloads.
//!
//! Once compression is negotiated each payload starts with an algorithm
//! byte: `0x00` for raw DEFLATE, `0xff` for uncompressed. Before that the
//! payload is a bare batch.

use flate2::Compression;
use std::{
    borrow::Cow,
    io::{self, Read, Write},
};

/// Default upper bound on a decompressed payload.
pub const DEFAULT_MAX_DECOMPRESSED: usize = 8 * 1024 * 1024; // 8 MiB

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("empty payload")]
    EmptyPayload,
    #[error("unknown compression algorithm {0:#04x}")]
    UnknownAlgorithm(u8),
    #[error("decompressed payload exceeds {0} bytes")]
    TooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::AsRefStr)]
pub enum CompressionAlgorithm {
    Zlib,
    None,
}

impl CompressionAlgorithm {
    pub fn indicator(self) -> u8 {
        match self {
            CompressionAlgorithm::Zlib => 0x00,
            CompressionAlgorithm::None => 0xff,
        }
    }

    pub fn from_indicator(byte: u8) -> Result<Self, CompressionError> {
        match byte {
            0x00 => Ok(CompressionAlgorithm::Zlib),
            0xff => Ok(CompressionAlgorithm::None),
            other => Err(CompressionError::UnknownAlgorithm(other)),
        }
    }

    /// Value used in the NetworkSettings packet.
    pub fn network_id(self) -> u16 {
        match self {
            CompressionAlgorithm::Zlib => 0,
            CompressionAlgorithm::None => 0xffff,
        }
    }
}

impl TryFrom<u16> for CompressionAlgorithm {
    type Error = CompressionError;

    /// Reads the algorithm field of a NetworkSettings packet.
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionAlgorithm::Zlib),
            0xffff => Ok(CompressionAlgorithm::None),
            other => Err(CompressionError::UnknownAlgorithm(other as u8)),
        }
    }
}

/// Compression state of one link.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CompressionState {
    /// Network settings not exchanged yet; payloads carry no indicator byte.
    #[default]
    Pending,
    /// Negotiated, payloads are sent with the `0xff` indicator.
    Disabled,
    /// Negotiated, payloads are DEFLATE-compressed.
    Enabled,
}

/// Threshold in bytes from which a batch is actually compressed.
#[derive(Copy, Clone, Debug)]
pub struct CompressionThreshold(usize);

impl CompressionThreshold {
    pub fn new(threshold: usize) -> Self {
        Self(threshold)
    }

    pub fn get(self) -> usize {
        self.0
    }
}

/// Raw DEFLATE compressor shared by every link.
#[derive(Debug, Clone)]
pub struct ZlibCompressor {
    level: Compression,
    threshold: CompressionThreshold,
    max_decompressed: usize,
}

impl ZlibCompressor {
    /// `level` must already be validated to `1..=9`.
    pub fn new(level: u32, threshold: CompressionThreshold, max_decompressed: usize) -> Self {
        Self {
            level: Compression::new(level),
            threshold,
            max_decompressed,
        }
    }

    /// Batches below the threshold are stored without compression but
    /// still framed as DEFLATE.
    pub fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let level = if data.len() < self.threshold.get() {
            Compression::none()
        } else {
            self.level
        };
        let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), level);
        encoder.write_all(data)?;
        encoder.finish()
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut buf = Vec::new();
        let limit = u64::try_from(self.max_decompressed).unwrap_or(u64::MAX);
        flate2::read::DeflateDecoder::new(data)
            .take(limit.saturating_add(1))
            .read_to_end(&mut buf)?;
        if buf.len() > self.max_decompressed {
            return Err(CompressionError::TooLarge(self.max_decompressed));
        }
        Ok(buf)
    }

    /// Wraps a batch according to `state`.
    pub fn encode_payload(&self, state: CompressionState, batch: Vec<u8>) -> io::Result<Vec<u8>> {
        Ok(match state {
            CompressionState::Pending => batch,
            CompressionState::Disabled => {
                let mut payload = Vec::with_capacity(batch.len() + 1);
                payload.push(CompressionAlgorithm::None.indicator());
                payload.extend_from_slice(&batch);
                payload
            }
            CompressionState::Enabled => {
                let compressed = self.compress(&batch)?;
                let mut payload = Vec::with_capacity(compressed.len() + 1);
                payload.push(CompressionAlgorithm::Zlib.indicator());
                payload.extend_from_slice(&compressed);
                payload
            }
        })
    }

    /// Strips the indicator and decompresses if needed, returning the batch.
    pub fn decode_payload<'a>(
        &self,
        state: CompressionState,
        payload: &'a [u8],
    ) -> Result<Cow<'a, [u8]>, CompressionError> {
        if state == CompressionState::Pending {
            return Ok(Cow::Borrowed(payload));
        }
        let (&indicator, rest) = payload
            .split_first()
            .ok_or(CompressionError::EmptyPayload)?;
        match CompressionAlgorithm::from_indicator(indicator)? {
            CompressionAlgorithm::Zlib => self.decompress(rest).map(Cow::Owned),
            CompressionAlgorithm::None => Ok(Cow::Borrowed(rest)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor() -> ZlibCompressor {
        ZlibCompressor::new(7, CompressionThreshold::new(256), 1024)
    }

    #[test]
    fn enabled_payload_round_trips() {
        let compressor = compressor();
        let batch = vec![7u8; 600];
        let payload = compressor
            .encode_payload(CompressionState::Enabled, batch.clone())
            .unwrap();
        assert_eq!(payload[0], 0x00);
        assert!(payload.len() < batch.len());
        let decoded = compressor
            .decode_payload(CompressionState::Enabled, &payload)
            .unwrap();
        assert_eq!(decoded.as_ref(), batch.as_slice());
    }

    #[test]
    fn pending_payload_has_no_indicator() {
        let compressor = compressor();
        let payload = compressor
            .encode_payload(CompressionState::Pending, vec![1, 2, 3])
            .unwrap();
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[test]
    fn disabled_payload_uses_ff_indicator() {
        let compressor = compressor();
        let payload = compressor
            .encode_payload(CompressionState::Disabled, vec![1, 2, 3])
            .unwrap();
        assert_eq!(payload, vec![0xff, 1, 2, 3]);
        let decoded = compressor
            .decode_payload(CompressionState::Enabled, &payload)
            .unwrap();
        assert_eq!(decoded.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let compressor = compressor();
        let compressed = compressor.compress(&vec![0u8; 4096]).unwrap();
        assert!(matches!(
            compressor.decompress(&compressed),
            Err(CompressionError::TooLarge(1024))
        ));
    }

    #[test]
    fn corrupt_payload_is_an_error() {
        let compressor = compressor();
        assert!(compressor
            .decode_payload(CompressionState::Enabled, &[0x00, 0xff, 0xff, 0xff, 0xff])
            .is_err());
    }

    #[test]
    fn unknown_indicator_is_rejected() {
        assert!(matches!(
            compressor().decode_payload(CompressionState::Enabled, &[0x42, 1]),
            Err(CompressionError::UnknownAlgorithm(0x42))
        ));
    }
}
