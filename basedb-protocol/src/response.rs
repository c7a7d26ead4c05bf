//! Query response layout and the writer the backend fills it with.
//!
//! ```text
//! response  := count:u16 (len:u32 result)*
//! result    := NODES count:u32 record*
//!            | AGGREGATE groups:u32 (key_len:u16 key slots)*
//! record    := NODE id:u32 (op:u8 len:u32 payload)* END
//! ```
//!
//! Record blocks:
//!
//! | op     | payload                                   |
//! |--------|-------------------------------------------|
//! | MAIN   | main bytes, full or the selected slices   |
//! | FIELD  | prop:u8 data                              |
//! | TEXT   | prop:u8 locale_len:u8 locale data         |
//! | META   | prop:u8 compressed:u8 raw_len size crc    |
//! | REF    | prop:u8 record?                           |
//! | REFS   | prop:u8 count:u32 record*                 |
//! | EDGE   | blocks of the edge type                   |

use bytes::{BufMut, Bytes, BytesMut};

use basedb_core::codec::LenPatch;
use basedb_core::string::StringMeta;
use basedb_core::NodeId;

pub const RESULT_NODES: u8 = 0;
pub const RESULT_AGGREGATE: u8 = 1;

pub const END: u8 = 0;
pub const NODE: u8 = 1;
pub const MAIN: u8 = 2;
pub const FIELD: u8 = 3;
pub const REF: u8 = 4;
pub const REFS: u8 = 5;
pub const EDGE: u8 = 6;
pub const META: u8 = 7;
pub const TEXT: u8 = 8;

/// Collects per-query results into one response buffer.
#[derive(Debug)]
pub struct ResponseWriter {
    buf: BytesMut,
    count: u16,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(1024);
        buf.put_u16_le(0);
        Self { buf, count: 0 }
    }

    pub fn push(&mut self, result: &[u8]) {
        self.buf.put_u32_le(result.len() as u32);
        self.buf.put_slice(result);
        self.count += 1;
    }

    pub fn finish(mut self) -> Bytes {
        (&mut self.buf[..2]).put_u16_le(self.count);
        self.buf.freeze()
    }
}

/// Writer of one node-list result.
#[derive(Debug)]
pub struct NodesWriter {
    buf: BytesMut,
    count: u32,
}

impl Default for NodesWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl NodesWriter {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u8(RESULT_NODES);
        buf.put_u32_le(0);
        Self { buf, count: 0 }
    }

    pub fn node(&mut self, id: NodeId) -> &mut BytesMut {
        self.count += 1;
        put_node_start(&mut self.buf, id);
        &mut self.buf
    }

    pub fn finish(mut self) -> Bytes {
        (&mut self.buf[1..5]).put_u32_le(self.count);
        self.buf.freeze()
    }
}

pub fn put_node_start(buf: &mut BytesMut, id: NodeId) {
    buf.put_u8(NODE);
    buf.put_u32_le(id);
}

pub fn put_node_end(buf: &mut BytesMut) {
    buf.put_u8(END);
}

/// `op len payload`, with the length back-patched.
pub fn put_block(buf: &mut BytesMut, op: u8, write: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(op);
    let pos = buf.reserve_len();
    write(buf);
    buf.patch_len(pos);
}

pub fn put_main(buf: &mut BytesMut, main: &[u8]) {
    put_block(buf, MAIN, |b| b.put_slice(main));
}

pub fn put_field(buf: &mut BytesMut, prop: u8, data: &[u8]) {
    put_block(buf, FIELD, |b| {
        b.put_u8(prop);
        b.put_slice(data);
    });
}

pub fn put_text(buf: &mut BytesMut, prop: u8, locale: &str, data: &[u8]) {
    put_block(buf, TEXT, |b| {
        b.put_u8(prop);
        b.put_u8(locale.len() as u8);
        b.put_slice(locale.as_bytes());
        b.put_slice(data);
    });
}

pub fn put_meta(buf: &mut BytesMut, prop: u8, meta: &StringMeta) {
    put_block(buf, META, |b| {
        b.put_u8(prop);
        b.put_u8(meta.compressed as u8);
        b.put_u32_le(meta.raw_len);
        b.put_u32_le(meta.size);
        b.put_u32_le(meta.crc);
    });
}

/// One aggregate result: `(group key, result slots)` per group. An
/// ungrouped aggregate is a single group with an empty key.
pub fn aggregate_result(groups: &[(String, Vec<u8>)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + groups.iter().map(|(k, s)| k.len() + s.len() + 2).sum::<usize>());
    buf.put_u8(RESULT_AGGREGATE);
    buf.put_u32_le(groups.len() as u32);
    for (key, slots) in groups {
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_slice(slots);
    }
    buf.freeze()
}
