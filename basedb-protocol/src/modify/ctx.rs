use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use basedb_core::block::block_key_for;
use basedb_core::string::StringCodec;
use basedb_core::{NodeId, TypeDef, TypeDefs};

use super::SWITCH_TYPE;

/// Builder state of one modify batch: the instruction buffer plus what the
/// trailer will describe.
#[derive(Debug)]
pub struct ModifyCtx {
    pub(crate) buf: BytesMut,
    pub(crate) defs: Arc<TypeDefs>,
    pub(crate) codec: StringCodec,
    /// Identifies tmp ids minted by this batch.
    pub(crate) batch: u64,
    pub(crate) locale: Option<String>,
    current_type: Option<u16>,
    /// type id → (last id before the batch, last id handed out)
    dirty_types: BTreeMap<u16, (u32, u32)>,
    dirty_ranges: BTreeSet<u64>,
    /// Client-local id counters, carried from batch to batch.
    last_ids: BTreeMap<u16, u32>,
    ops: usize,
}

/// Rollback point taken before serializing one operation.
#[derive(Debug, Clone)]
pub struct ModifyMark {
    len: usize,
    current_type: Option<u16>,
    dirty_types: BTreeMap<u16, (u32, u32)>,
    dirty_ranges: BTreeSet<u64>,
    last_ids: BTreeMap<u16, u32>,
    ops: usize,
}

pub(crate) const HEADER_LEN: usize = 8;

impl ModifyCtx {
    /// Start a batch. `last_ids` holds the client's current per-type counters.
    pub fn new(defs: Arc<TypeDefs>, codec: StringCodec, batch: u64, last_ids: BTreeMap<u16, u32>) -> Self {
        let mut buf = BytesMut::with_capacity(4096);
        buf.put_u64_le(defs.hash);
        Self {
            buf,
            defs,
            codec,
            batch,
            locale: None,
            current_type: None,
            dirty_types: BTreeMap::new(),
            dirty_ranges: BTreeSet::new(),
            last_ids,
            ops: 0,
        }
    }

    pub fn defs(&self) -> &Arc<TypeDefs> {
        &self.defs
    }

    pub fn batch(&self) -> u64 {
        self.batch
    }

    pub fn set_locale(&mut self, locale: Option<String>) {
        self.locale = locale;
    }

    /// Bytes written so far, header included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops == 0
    }

    pub fn ops(&self) -> usize {
        self.ops
    }

    pub fn mark(&self) -> ModifyMark {
        ModifyMark {
            len: self.buf.len(),
            current_type: self.current_type,
            dirty_types: self.dirty_types.clone(),
            dirty_ranges: self.dirty_ranges.clone(),
            last_ids: self.last_ids.clone(),
            ops: self.ops,
        }
    }

    /// Drop everything written since `mark`.
    pub fn rollback(&mut self, mark: ModifyMark) {
        self.buf.truncate(mark.len);
        self.current_type = mark.current_type;
        self.dirty_types = mark.dirty_types;
        self.dirty_ranges = mark.dirty_ranges;
        self.last_ids = mark.last_ids;
        self.ops = mark.ops;
    }

    /// Bytes written since `mark`.
    pub fn since(&self, mark: &ModifyMark) -> usize {
        self.buf.len() - mark.len
    }

    pub(crate) fn switch_type(&mut self, def: &TypeDef) {
        if self.current_type != Some(def.id) {
            self.buf.put_u8(SWITCH_TYPE);
            self.buf.put_u16_le(def.id);
            self.current_type = Some(def.id);
        }
    }

    pub(crate) fn mark_dirty(&mut self, def: &TypeDef, id: NodeId) {
        self.dirty_ranges.insert(block_key_for(def.id, def.block_capacity, id));
    }

    /// Hand out the next client-local id of a type.
    pub(crate) fn next_id(&mut self, def: &TypeDef) -> NodeId {
        let last = self.last_ids.entry(def.id).or_insert(0);
        let entry = self.dirty_types.entry(def.id).or_insert((*last, *last));
        *last += 1;
        entry.1 = *last;
        *last
    }

    pub(crate) fn op_done(&mut self) {
        self.ops += 1;
    }

    /// Pre-batch last id of a type, if the batch creates nodes of it.
    pub fn created_range(&self, type_id: u16) -> Option<(u32, u32)> {
        self.dirty_types.get(&type_id).copied()
    }

    pub fn last_ids(&self) -> &BTreeMap<u16, u32> {
        &self.last_ids
    }

    pub fn dirty_ranges(&self) -> impl Iterator<Item = u64> + '_ {
        self.dirty_ranges.iter().copied()
    }

    /// Close the batch: append the trailer and return the buffer.
    pub fn finish(mut self) -> Bytes {
        let instr_len = self.buf.len() - HEADER_LEN;
        self.buf.put_u16_le(self.dirty_types.len() as u16);
        for (type_id, (start, last)) in &self.dirty_types {
            self.buf.put_u16_le(*type_id);
            self.buf.put_u32_le(*start);
            self.buf.put_u32_le(*last);
        }
        self.buf.put_u32_le(self.dirty_ranges.len() as u32);
        for key in &self.dirty_ranges {
            // Block keys stay below 2^53, so f64 is exact.
            self.buf.put_f64_le(*key as f64);
        }
        self.buf.put_u32_le(instr_len as u32);
        self.buf.freeze()
    }
}
