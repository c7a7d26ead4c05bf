//! Block and string compression.
//!
//! The algorithm is chosen by [`CompressionType`]; callers that only need
//! "compress or not" go through the [`Compressor`] trait so tests can swap
//! the implementation.

use crate::config::{CompressionAlgorithm, CompressionConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Zstd = 1,
    Snappy = 2,
}

impl TryFrom<u8> for CompressionType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            2 => Ok(CompressionType::Snappy),
            _ => Err(Error::Compression {
                message: format!("invalid compression type: {}", value),
            }),
        }
    }
}

impl From<CompressionAlgorithm> for CompressionType {
    fn from(algorithm: CompressionAlgorithm) -> Self {
        match algorithm {
            CompressionAlgorithm::None => CompressionType::None,
            CompressionAlgorithm::Zstd => CompressionType::Zstd,
            CompressionAlgorithm::Snappy => CompressionType::Snappy,
        }
    }
}

pub fn compress_block(data: &[u8], compression: CompressionType, level: i32) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => zstd::encode_all(data, level).map_err(|e| Error::Compression {
            message: format!("zstd compression failed: {}", e),
        }),
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Compression {
                message: format!("snappy compression failed: {}", e),
            }),
    }
}

pub fn decompress_block(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zstd => zstd::decode_all(data).map_err(|e| Error::Compression {
            message: format!("zstd decompression failed: {}", e),
        }),
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Compression {
                message: format!("snappy decompression failed: {}", e),
            }),
    }
}

/// Compression used for individual string fields.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// `raw_len` is the length recorded at write time.
    fn decompress(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>>;
}

/// Default field compressor backed by [`compress_block`].
#[derive(Debug, Clone, Copy)]
pub struct BlockCompressor {
    pub compression: CompressionType,
    pub level: i32,
}

impl BlockCompressor {
    pub fn from_config(config: &CompressionConfig) -> Self {
        Self {
            compression: config.algorithm.into(),
            level: config.level,
        }
    }
}

impl Default for BlockCompressor {
    fn default() -> Self {
        Self {
            compression: CompressionType::Zstd,
            level: 3,
        }
    }
}

impl Compressor for BlockCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        compress_block(data, self.compression, self.level)
    }

    fn decompress(&self, data: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let out = decompress_block(data, self.compression)?;
        if out.len() != raw_len {
            return Err(Error::Compression {
                message: format!("inflated {} bytes, expected {}", out.len(), raw_len),
            });
        }
        Ok(out)
    }
}
