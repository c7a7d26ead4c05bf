//! String field encoding.
//!
//! ```text
//! variable:  [compressed u8][raw_len u32][bytes ...][crc32 u32]
//! fixed:     [len u8][bytes ...][zero padding]           (max_bytes + 1)
//! ```
//!
//! Text is NFKD-normalised before it is written. The CRC covers the bytes as
//! written, so a reader can validate a field without inflating it.

use std::sync::Arc;

use unicode_normalization::UnicodeNormalization;

use bytes::BufMut;

use crate::codec::ByteReader;
use crate::compression::{BlockCompressor, Compressor};
use crate::error::{Error, Result};
use crate::hash::crc32;

pub const STRING_RAW: u8 = 0;
pub const STRING_COMPRESSED: u8 = 1;

/// Header (flag + raw length) and trailer (crc) around the string bytes.
pub const STRING_OVERHEAD: usize = 1 + 4 + 4;

/// Integrity metadata of an encoded string field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringMeta {
    pub compressed: bool,
    /// Length of the normalised UTF-8 text.
    pub raw_len: u32,
    /// Length of the bytes as stored.
    pub size: u32,
    pub crc: u32,
}

#[derive(Clone)]
pub struct StringCodec {
    compressor: Arc<dyn Compressor>,
    threshold: usize,
}

impl StringCodec {
    pub fn new(compressor: Arc<dyn Compressor>, threshold: usize) -> Self {
        Self {
            compressor,
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Encode `s`, compressing when allowed, over the threshold and smaller.
    pub fn encode(&self, s: &str, allow_compression: bool) -> Result<Vec<u8>> {
        let normalized = normalize(s);
        let raw = normalized.as_bytes();

        let mut flag = STRING_RAW;
        let mut packed = None;
        if allow_compression && raw.len() > self.threshold {
            let c = self.compressor.compress(raw)?;
            if c.len() < raw.len() {
                flag = STRING_COMPRESSED;
                packed = Some(c);
            }
        }
        let data = packed.as_deref().unwrap_or(raw);

        let mut out = Vec::with_capacity(data.len() + STRING_OVERHEAD);
        out.put_u8(flag);
        out.put_u32_le(raw.len() as u32);
        out.put_slice(data);
        out.put_u32_le(crc32(data));
        Ok(out)
    }

    pub fn meta(encoded: &[u8]) -> Result<StringMeta> {
        let (compressed, raw_len, data, crc) = split(encoded)?;
        Ok(StringMeta {
            compressed,
            raw_len,
            size: data.len() as u32,
            crc,
        })
    }

    pub fn decode(&self, encoded: &[u8]) -> Result<String> {
        let (compressed, raw_len, data, crc) = split(encoded)?;
        let actual = crc32(data);
        if actual != crc {
            return Err(Error::Checksum {
                what: "string field".to_string(),
                expected: crc,
                actual,
            });
        }
        let bytes = if compressed {
            self.compressor.decompress(data, raw_len as usize)?
        } else {
            data.to_vec()
        };
        String::from_utf8(bytes).map_err(|e| Error::malformed("string", e.to_string()))
    }
}

impl Default for StringCodec {
    fn default() -> Self {
        Self::new(Arc::new(BlockCompressor::default()), 200)
    }
}

impl std::fmt::Debug for StringCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StringCodec")
            .field("threshold", &self.threshold)
            .finish()
    }
}

fn split(encoded: &[u8]) -> Result<(bool, u32, &[u8], u32)> {
    if encoded.len() < STRING_OVERHEAD {
        return Err(Error::malformed("string", "field shorter than header"));
    }
    let mut r = ByteReader::new(encoded, "string");
    let flag = r.u8()?;
    let raw_len = r.u32()?;
    let data = r.bytes(encoded.len() - STRING_OVERHEAD)?;
    let crc = r.u32()?;
    Ok((flag == STRING_COMPRESSED, raw_len, data, crc))
}

/// Pack `s` into a fixed-width slot of `max_bytes + 1` bytes.
pub fn encode_fixed(s: &str, max_bytes: usize, slot: &mut [u8]) -> Result<()> {
    let normalized: String = s.nfkd().collect();
    let bytes = normalized.as_bytes();
    if bytes.len() > max_bytes || slot.len() != max_bytes + 1 {
        return Err(Error::InvalidValue {
            type_name: String::new(),
            path: String::new(),
            message: format!("{} bytes does not fit in {} bytes", bytes.len(), max_bytes),
        });
    }
    slot.fill(0);
    slot[0] = bytes.len() as u8;
    slot[1..1 + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

pub fn decode_fixed(slot: &[u8]) -> Result<String> {
    let len = *slot
        .first()
        .ok_or_else(|| Error::malformed("fixed string", "empty slot"))? as usize;
    let bytes = slot
        .get(1..1 + len)
        .ok_or_else(|| Error::malformed("fixed string", "length past slot"))?;
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::malformed("fixed string", e.to_string()))
}

/// NFKD form of `s`, as stored.
pub fn normalize(s: &str) -> String {
    s.nfkd().collect()
}

/// Lowercased NFKD tokens used by lexical search.
pub fn search_tokens(s: &str) -> Vec<String> {
    s.nfkd()
        .collect::<String>()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_string_is_not_compressed() {
        let codec = StringCodec::default();
        let enc = codec.encode("snurp", true).unwrap();
        let meta = StringCodec::meta(&enc).unwrap();
        assert!(!meta.compressed);
        assert_eq!(meta.raw_len, 5);
        assert_eq!(codec.decode(&enc).unwrap(), "snurp");
    }

    #[test]
    fn test_long_compressible_string_shrinks() {
        let codec = StringCodec::default();
        let s = "derp derp derp ".repeat(100);
        let enc = codec.encode(&s, true).unwrap();
        assert!(enc.len() < s.len());
        assert!(StringCodec::meta(&enc).unwrap().compressed);
        assert_eq!(codec.decode(&enc).unwrap(), s);

        let plain = codec.encode(&s, false).unwrap();
        assert_eq!(plain.len(), s.len() + STRING_OVERHEAD);
        assert_eq!(codec.decode(&plain).unwrap(), s);
    }

    #[test]
    fn test_corruption_is_detected() {
        let codec = StringCodec::default();
        let mut enc = codec.encode("hello world", false).unwrap();
        enc[6] ^= 0xff;
        assert!(matches!(codec.decode(&enc), Err(Error::Checksum { .. })));
    }

    #[test]
    fn test_fixed_slot() {
        let mut slot = [0xAAu8; 11];
        encode_fixed("abc", 10, &mut slot).unwrap();
        assert_eq!(&slot[..5], &[3, b'a', b'b', b'c', 0]);
        assert_eq!(decode_fixed(&slot).unwrap(), "abc");
        assert!(encode_fixed("this is way too long", 10, &mut slot).is_err());
    }

    #[test]
    fn test_search_tokens() {
        assert_eq!(search_tokens("Hello, World! foo_bar"), vec!["hello", "world", "foo", "bar"]);
    }
}
