//! Backend-side view of a modify batch.

use basedb_core::codec::ByteReader;
use basedb_core::{Error, NodeId, PropKind, Result};

use super::*;

const WHAT: &str = "modify";

/// Per-type created range and dirty block keys, as reported by the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trailer {
    /// `(type_id, last id before the batch, last local id)`
    pub types: Vec<(u16, u32, u32)>,
    pub ranges: Vec<u64>,
}

impl Trailer {
    pub fn created(&self, type_id: u16) -> Option<(u32, u32)> {
        self.types
            .iter()
            .find(|(t, _, _)| *t == type_id)
            .map(|(_, start, last)| (*start, *last))
    }
}

#[derive(Debug, Clone)]
pub struct ModifyBatch<'a> {
    pub schema_hash: u64,
    pub instrs: &'a [u8],
    pub trailer: Trailer,
}

impl<'a> ModifyBatch<'a> {
    pub fn iter(&self) -> InstrIter<'a> {
        InstrIter {
            r: ByteReader::new(self.instrs, WHAT),
            failed: false,
        }
    }
}

/// Split a batch into header, instructions and trailer.
pub fn parse_batch(buf: &[u8]) -> Result<ModifyBatch<'_>> {
    if buf.len() < HEADER_LEN_WITH_TAIL {
        return Err(Error::malformed(WHAT, format!("{} bytes is too short", buf.len())));
    }
    let mut head = ByteReader::new(&buf[..8], WHAT);
    let schema_hash = head.u64()?;
    let mut tail = ByteReader::new(&buf[buf.len() - 4..], WHAT);
    let instr_len = tail.u32()? as usize;
    let instr_end = 8 + instr_len;
    if instr_end > buf.len() - 4 {
        return Err(Error::malformed(WHAT, "instruction length past end of buffer"));
    }

    let mut r = ByteReader::new(&buf[instr_end..buf.len() - 4], WHAT);
    let mut trailer = Trailer::default();
    for _ in 0..r.u16()? {
        trailer.types.push((r.u16()?, r.u32()?, r.u32()?));
    }
    for _ in 0..r.u32()? {
        trailer.ranges.push(r.f64()? as u64);
    }

    Ok(ModifyBatch {
        schema_hash,
        instrs: &buf[8..instr_end],
        trailer,
    })
}

const HEADER_LEN_WITH_TAIL: usize = 8 + 2 + 4 + 4;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr<'a> {
    SwitchType(u16),
    Create {
        id: NodeId,
        blocks: Vec<Block<'a>>,
    },
    Update {
        id: NodeId,
        blocks: Vec<Block<'a>>,
    },
    Upsert {
        alias_prop: u8,
        alias: &'a str,
        id: NodeId,
        blocks: Vec<Block<'a>>,
    },
    Insert {
        alias_prop: u8,
        alias: &'a str,
        id: NodeId,
        blocks: Vec<Block<'a>>,
    },
    Delete {
        id: NodeId,
    },
}

/// One property block of a node instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Block<'a> {
    Main(&'a [u8]),
    /// `(start, bytes)` slices of the main buffer.
    PartialMain(Vec<(u16, &'a [u8])>),
    Increment {
        start: u16,
        kind: PropKind,
        delta: f64,
    },
    Field {
        prop: u8,
        data: &'a [u8],
    },
    Text {
        prop: u8,
        locale: &'a str,
        data: &'a [u8],
    },
    Cardinality {
        prop: u8,
        hashes: Vec<u64>,
    },
    DeleteField {
        prop: u8,
    },
    Reference {
        prop: u8,
        is_tmp: bool,
        id: NodeId,
        edges: Vec<Block<'a>>,
    },
    References {
        prop: u8,
        ops: Vec<RefOp<'a>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefOp<'a> {
    Ids(Vec<NodeId>),
    TmpIds(Vec<NodeId>),
    WithMeta(Vec<EdgeItem<'a>>),
    Delete(Vec<NodeId>),
    Clear,
}

/// A reference target carrying edge properties or a list position.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeItem<'a> {
    pub id: NodeId,
    pub is_tmp: bool,
    pub index: Option<u32>,
    pub edges: Vec<Block<'a>>,
}

/// Iterator over the instructions of a batch. Stops after the first error.
pub struct InstrIter<'a> {
    r: ByteReader<'a>,
    failed: bool,
}

impl<'a> Iterator for InstrIter<'a> {
    type Item = Result<Instr<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.r.is_empty() {
            return None;
        }
        let out = read_instr(&mut self.r);
        self.failed = out.is_err();
        Some(out)
    }
}

fn read_instr<'a>(r: &mut ByteReader<'a>) -> Result<Instr<'a>> {
    let op = r.u8()?;
    Ok(match op {
        SWITCH_TYPE => Instr::SwitchType(r.u16()?),
        CREATE => {
            let id = r.u32()?;
            Instr::Create {
                id,
                blocks: read_node_blocks(r)?,
            }
        }
        UPDATE => {
            let id = r.u32()?;
            Instr::Update {
                id,
                blocks: read_node_blocks(r)?,
            }
        }
        UPSERT | INSERT => {
            let alias_prop = r.u8()?;
            let len = r.u16()? as usize;
            let alias = utf8(r.bytes(len)?)?;
            let id = r.u32()?;
            let blocks = read_node_blocks(r)?;
            if op == UPSERT {
                Instr::Upsert {
                    alias_prop,
                    alias,
                    id,
                    blocks,
                }
            } else {
                Instr::Insert {
                    alias_prop,
                    alias,
                    id,
                    blocks,
                }
            }
        }
        DELETE => Instr::Delete { id: r.u32()? },
        other => return Err(Error::malformed(WHAT, format!("unknown instruction {}", other))),
    })
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| Error::malformed(WHAT, e.to_string()))
}

fn read_node_blocks<'a>(r: &mut ByteReader<'a>) -> Result<Vec<Block<'a>>> {
    let mut blocks = Vec::new();
    loop {
        match r.peek_u8() {
            Some(NODE_END) => {
                r.u8()?;
                return Ok(blocks);
            }
            Some(_) => blocks.push(read_block(r)?),
            None => return Err(Error::malformed(WHAT, "node without NODE_END")),
        }
    }
}

fn read_edge_blocks(section: &[u8]) -> Result<Vec<Block<'_>>> {
    let mut r = ByteReader::new(section, WHAT);
    let mut blocks = Vec::new();
    while !r.is_empty() {
        blocks.push(read_block(&mut r)?);
    }
    Ok(blocks)
}

fn read_block<'a>(r: &mut ByteReader<'a>) -> Result<Block<'a>> {
    let op = r.u8()?;
    Ok(match op {
        MAIN => {
            let len = r.u16()? as usize;
            Block::Main(r.bytes(len)?)
        }
        PARTIAL_MAIN => {
            let count = r.u16()? as usize;
            let mut slices = Vec::with_capacity(count);
            for _ in 0..count {
                slices.push((r.u16()?, r.u16()? as usize));
            }
            let mut out = Vec::with_capacity(count);
            for (start, size) in slices {
                out.push((start, r.bytes(size)?));
            }
            Block::PartialMain(out)
        }
        INCREMENT => {
            let start = r.u16()?;
            let kind = r.u8()?;
            let kind = PropKind::from_u8(kind)
                .ok_or_else(|| Error::malformed(WHAT, format!("unknown property kind {}", kind)))?;
            Block::Increment {
                start,
                kind,
                delta: r.f64()?,
            }
        }
        FIELD => {
            let prop = r.u8()?;
            Block::Field {
                prop,
                data: r.section()?,
            }
        }
        TEXT => {
            let prop = r.u8()?;
            let len = r.u8()? as usize;
            let locale = utf8(r.bytes(len)?)?;
            Block::Text {
                prop,
                locale,
                data: r.section()?,
            }
        }
        CARDINALITY => {
            let prop = r.u8()?;
            let count = r.u32()? as usize;
            let mut hashes = Vec::with_capacity(count.min(r.remaining() / 8));
            for _ in 0..count {
                hashes.push(r.u64()?);
            }
            Block::Cardinality { prop, hashes }
        }
        DELETE_FIELD => Block::DeleteField { prop: r.u8()? },
        REFERENCE => {
            let prop = r.u8()?;
            let mut body = ByteReader::new(r.section()?, WHAT);
            let is_tmp = body.u8()? != 0;
            let id = body.u32()?;
            let edges = read_edge_blocks(body.section()?)?;
            Block::Reference {
                prop,
                is_tmp,
                id,
                edges,
            }
        }
        REFERENCES => {
            let prop = r.u8()?;
            let mut body = ByteReader::new(r.section()?, WHAT);
            let mut ops = Vec::new();
            while !body.is_empty() {
                let op = body.u8()?;
                let mut payload = ByteReader::new(body.section()?, WHAT);
                ops.push(read_ref_op(op, &mut payload)?);
            }
            Block::References { prop, ops }
        }
        other => return Err(Error::malformed(WHAT, format!("unknown block {}", other))),
    })
}

fn read_ids(r: &mut ByteReader<'_>) -> Result<Vec<NodeId>> {
    let count = r.u32()? as usize;
    let mut ids = Vec::with_capacity(count.min(r.remaining() / 4));
    for _ in 0..count {
        ids.push(r.u32()?);
    }
    Ok(ids)
}

fn read_ref_op<'a>(op: u8, r: &mut ByteReader<'a>) -> Result<RefOp<'a>> {
    Ok(match op {
        REF_IDS => RefOp::Ids(read_ids(r)?),
        REF_TMP_IDS => RefOp::TmpIds(read_ids(r)?),
        REF_DEL_IDS => RefOp::Delete(read_ids(r)?),
        REF_CLEAR => RefOp::Clear,
        REF_IDS_WITH_META => {
            let count = r.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                let id = r.u32()?;
                let is_tmp = r.u8()? != 0;
                let index = match r.u8()? {
                    0 => None,
                    _ => Some(r.u32()?),
                };
                let edges = read_edge_blocks(r.section()?)?;
                items.push(EdgeItem {
                    id,
                    is_tmp,
                    index,
                    edges,
                });
            }
            RefOp::WithMeta(items)
        }
        other => return Err(Error::malformed(WHAT, format!("unknown reference op {}", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_empty_batch() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(42);
        buf.put_u16_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        let batch = parse_batch(&buf).unwrap();
        assert_eq!(batch.schema_hash, 42);
        assert_eq!(batch.iter().count(), 0);
        assert_eq!(batch.trailer, Trailer::default());
    }

    #[test]
    fn test_truncated_batch_is_malformed() {
        assert!(parse_batch(&[0u8; 5]).is_err());
        let mut buf = BytesMut::new();
        buf.put_u64_le(1);
        buf.put_u16_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(1_000);
        assert!(matches!(parse_batch(&buf), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(1);
        buf.put_u8(99);
        buf.put_u8(SWITCH_TYPE);
        buf.put_u16_le(1);
        let instr_len = buf.len() - 8;
        buf.put_u16_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(instr_len as u32);
        let batch = parse_batch(&buf).unwrap();
        let out: Vec<_> = batch.iter().collect();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_err());
    }
}
