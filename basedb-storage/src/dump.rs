//! # Block dump files
//!
//! One file per block, named `{type}_{start}_{end}.sdb`, plus `common.sdb`
//! holding the per-type id counters.
//!
//! ```text
//! block dump:
//! ┌──────────┬─────────┬──────┬───────┬─────┬─────────────┬─────────────┬─────────┬───────┐
//! │ BASEDBLK │ version │ type │ start │ end │ compression │ payload_len │ payload │ crc32 │
//! │ 8 bytes  │ u32     │ u16  │ u32   │ u32 │ u8          │ u32         │ ...     │ u32   │
//! └──────────┴─────────┴──────┴───────┴─────┴─────────────┴─────────────┴─────────┴───────┘
//!
//! common.sdb:
//! ┌──────────┬─────────┬───────┬──────────────────────┬───────┐
//! │ BASEDBCM │ version │ count │ (type u16 last u32)* │ crc32 │
//! └──────────┴─────────┴───────┴──────────────────────┴───────┘
//! ```
//!
//! The CRC covers everything before it.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use basedb_core::block::dump_file_name;
use basedb_core::compression::{compress_block, decompress_block, CompressionType};
use basedb_core::hash::crc32;
use basedb_core::{Error, Result};

pub const BLOCK_MAGIC: &[u8; 8] = b"BASEDBLK";
pub const COMMON_MAGIC: &[u8; 8] = b"BASEDBCM";
pub const DUMP_VERSION: u32 = 1;
pub const COMMON_FILE: &str = "common.sdb";

const BLOCK_HEADER_LEN: usize = 8 + 4 + 2 + 4 + 4 + 1 + 4;

/// Identity of a dump file, parsed from its name or header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DumpInfo {
    pub type_id: u16,
    pub start: u32,
    pub end: u32,
}

impl DumpInfo {
    pub fn file_name(&self) -> String {
        dump_file_name(self.type_id, self.start, self.end)
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Parse `{type}_{start}_{end}.sdb`.
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".sdb")?;
        let mut parts = stem.splitn(3, '_');
        Some(Self {
            type_id: parts.next()?.parse().ok()?,
            start: parts.next()?.parse().ok()?,
            end: parts.next()?.parse().ok()?,
        })
    }
}

fn corrupt(what: &str, message: impl Into<String>) -> Error {
    Error::malformed("dump", format!("{}: {}", what, message.into()))
}

/// Serialize a block payload into dump file bytes.
pub fn encode_dump(info: DumpInfo, payload: &[u8], compression: CompressionType, level: i32) -> Result<Vec<u8>> {
    let body = compress_block(payload, compression, level)?;
    let mut buf = Vec::with_capacity(BLOCK_HEADER_LEN + body.len() + 4);
    buf.write_all(BLOCK_MAGIC)?;
    buf.write_u32::<LittleEndian>(DUMP_VERSION)?;
    buf.write_u16::<LittleEndian>(info.type_id)?;
    buf.write_u32::<LittleEndian>(info.start)?;
    buf.write_u32::<LittleEndian>(info.end)?;
    buf.write_u8(compression as u8)?;
    buf.write_u32::<LittleEndian>(body.len() as u32)?;
    buf.write_all(&body)?;
    let crc = crc32(&buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

/// Validate dump file bytes and return the header and inflated payload.
pub fn decode_dump(data: &[u8]) -> Result<(DumpInfo, Vec<u8>)> {
    if data.len() < BLOCK_HEADER_LEN + 4 {
        return Err(corrupt("block", format!("{} bytes is too short", data.len())));
    }
    let (body, footer) = data.split_at(data.len() - 4);
    let expected = Cursor::new(footer).read_u32::<LittleEndian>()?;
    let actual = crc32(body);
    if expected != actual {
        return Err(Error::Checksum {
            what: "block dump".to_string(),
            expected,
            actual,
        });
    }

    let mut cursor = Cursor::new(body);
    let mut magic = [0u8; 8];
    cursor.read_exact(&mut magic)?;
    if &magic != BLOCK_MAGIC {
        return Err(corrupt("block", "bad magic"));
    }
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != DUMP_VERSION {
        return Err(corrupt("block", format!("unsupported version {}", version)));
    }
    let info = DumpInfo {
        type_id: cursor.read_u16::<LittleEndian>()?,
        start: cursor.read_u32::<LittleEndian>()?,
        end: cursor.read_u32::<LittleEndian>()?,
    };
    let compression = CompressionType::try_from(cursor.read_u8()?)?;
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let offset = cursor.position() as usize;
    if offset + len != body.len() {
        return Err(corrupt("block", "payload length does not match file size"));
    }
    let payload = decompress_block(&body[offset..], compression)?;
    Ok((info, payload))
}

pub fn read_dump(path: &Path) -> Result<(DumpInfo, Vec<u8>)> {
    let data = std::fs::read(path)?;
    decode_dump(&data)
}

pub fn encode_common(last_ids: &BTreeMap<u16, u32>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + 4 + 2 + last_ids.len() * 6 + 4);
    buf.write_all(COMMON_MAGIC)?;
    buf.write_u32::<LittleEndian>(DUMP_VERSION)?;
    buf.write_u16::<LittleEndian>(last_ids.len() as u16)?;
    for (type_id, last) in last_ids {
        buf.write_u16::<LittleEndian>(*type_id)?;
        buf.write_u32::<LittleEndian>(*last)?;
    }
    let crc = crc32(&buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

pub fn decode_common(data: &[u8]) -> Result<BTreeMap<u16, u32>> {
    if data.len() < 8 + 4 + 2 + 4 {
        return Err(corrupt("common", "too short"));
    }
    let (body, footer) = data.split_at(data.len() - 4);
    let expected = Cursor::new(footer).read_u32::<LittleEndian>()?;
    let actual = crc32(body);
    if expected != actual {
        return Err(Error::Checksum {
            what: COMMON_FILE.to_string(),
            expected,
            actual,
        });
    }
    let mut cursor = Cursor::new(body);
    let mut magic = [0u8; 8];
    cursor.read_exact(&mut magic)?;
    if &magic != COMMON_MAGIC {
        return Err(corrupt("common", "bad magic"));
    }
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != DUMP_VERSION {
        return Err(corrupt("common", format!("unsupported version {}", version)));
    }
    let mut out = BTreeMap::new();
    for _ in 0..cursor.read_u16::<LittleEndian>()? {
        let type_id = cursor.read_u16::<LittleEndian>()?;
        out.insert(type_id, cursor.read_u32::<LittleEndian>()?);
    }
    Ok(out)
}

/// Every block dump in `dir`, sorted by type and start.
pub fn list_dumps(dir: &Path) -> Result<Vec<DumpInfo>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(info) = entry.file_name().to_str().and_then(DumpInfo::parse) {
            out.push(info);
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info() -> DumpInfo {
        DumpInfo {
            type_id: 2,
            start: 100_001,
            end: 200_000,
        }
    }

    #[test]
    fn test_dump_roundtrip_all_compressions() {
        let payload = b"some block payload some block payload some block payload".repeat(20);
        for compression in [CompressionType::None, CompressionType::Zstd, CompressionType::Snappy] {
            let bytes = encode_dump(info(), &payload, compression, 3).unwrap();
            let (decoded, out) = decode_dump(&bytes).unwrap();
            assert_eq!(decoded, info());
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let mut bytes = encode_dump(info(), b"payload", CompressionType::None, 0).unwrap();
        bytes[BLOCK_HEADER_LEN] ^= 0x01;
        let err = decode_dump(&bytes).unwrap_err();
        assert_eq!(err.error_code(), "CHECKSUM_MISMATCH");
    }

    #[test]
    fn test_file_names() {
        assert_eq!(info().file_name(), "2_100001_200000.sdb");
        assert_eq!(DumpInfo::parse("2_100001_200000.sdb"), Some(info()));
        assert_eq!(DumpInfo::parse("common.sdb"), None);
        assert_eq!(DumpInfo::parse("2_1.sdb"), None);
    }

    #[test]
    fn test_common_and_listing() {
        let dir = TempDir::new().unwrap();
        let ids = BTreeMap::from([(1u16, 400_000u32), (2, 3)]);
        std::fs::write(dir.path().join(COMMON_FILE), encode_common(&ids).unwrap()).unwrap();
        std::fs::write(info().path(dir.path()), encode_dump(info(), b"x", CompressionType::None, 0).unwrap()).unwrap();

        let data = std::fs::read(dir.path().join(COMMON_FILE)).unwrap();
        assert_eq!(decode_common(&data).unwrap(), ids);
        assert_eq!(list_dumps(dir.path()).unwrap(), vec![info()]);
        assert_eq!(read_dump(&info().path(dir.path())).unwrap().1, b"x");
    }
}
