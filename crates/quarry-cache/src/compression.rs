//! Transparent deflate compression of large values.

use crate::error::Result;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Bytes as stored, with the flag that says how to read them back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// Stored bytes
    pub bytes: Vec<u8>,
    /// Whether `bytes` is deflate-compressed
    pub compressed: bool,
}

impl StoredValue {
    /// Encode `value`, compressing it when it exceeds `threshold` bytes.
    ///
    /// Compression is skipped when it would not make the value smaller.
    pub fn encode(value: &[u8], threshold: usize) -> Result<Self> {
        if value.len() <= threshold {
            return Ok(Self::plain(value));
        }

        let mut encoder = DeflateEncoder::new(Vec::with_capacity(value.len() / 2), Compression::default());
        encoder.write_all(value)?;
        let compressed = encoder.finish()?;

        if compressed.len() < value.len() {
            Ok(Self {
                bytes: compressed,
                compressed: true,
            })
        } else {
            Ok(Self::plain(value))
        }
    }

    /// Original bytes.
    pub fn decode(&self) -> Result<Vec<u8>> {
        if !self.compressed {
            return Ok(self.bytes.clone());
        }

        let mut decoder = DeflateDecoder::new(self.bytes.as_slice());
        let mut out = Vec::with_capacity(self.bytes.len() * 2);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    fn plain(value: &[u8]) -> Self {
        Self {
            bytes: value.to_vec(),
            compressed: false,
        }
    }
}
