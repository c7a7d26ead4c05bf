//! # Block Map
//!
//! Per-type state of every storage block: content hash, whether its nodes
//! are in memory, and whether it changed since the last save.
//!
//! ```text
//!            load                 write
//!  absent ─────────> inmem ───────────────> inmem + dirty
//!                     │  ▲                       │
//!              unload │  │ load             save │
//!                     ▼  │                       ▼
//!                  offloaded               inmem (clean)
//! ```
//!
//! Keys are `type_id * 2^32 + start` (see [`basedb_core::block`]).

use std::collections::BTreeMap;

use basedb_core::block::{block_end, block_key, split_key};
use basedb_core::hash::{Hash, RunningDigest, EMPTY_HASH};
use basedb_core::{Error, Result, TypeDefs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockState {
    pub hash: Hash,
    pub inmem: bool,
    pub dirty: bool,
}

impl Default for BlockState {
    fn default() -> Self {
        Self {
            hash: EMPTY_HASH,
            inmem: true,
            dirty: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct TypeBlocks {
    capacity: u32,
    /// start id → state
    blocks: BTreeMap<u32, BlockState>,
}

/// A dirty block as yielded by [`BlockMap::dirty_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyBlock {
    pub type_id: u16,
    pub start: u32,
    pub end: u32,
    pub state: BlockState,
}

#[derive(Debug, Default)]
pub struct BlockMap {
    types: BTreeMap<u16, TypeBlocks>,
}

impl BlockMap {
    pub fn new(defs: &TypeDefs) -> Self {
        let mut map = Self::default();
        map.update_types(defs);
        map
    }

    fn type_blocks(&self, type_id: u16) -> Result<&TypeBlocks> {
        self.types.get(&type_id).ok_or_else(|| Error::type_not_found(type_id))
    }

    fn type_blocks_mut(&mut self, type_id: u16) -> Result<&mut TypeBlocks> {
        self.types.get_mut(&type_id).ok_or_else(|| Error::type_not_found(type_id))
    }

    /// Carry block state over to a new schema generation. Types that no
    /// longer exist are dropped, new types start empty.
    pub fn update_types(&mut self, defs: &TypeDefs) {
        let mut next = BTreeMap::new();
        for def in defs.all() {
            let mut blocks = self.types.remove(&def.id).unwrap_or_default();
            blocks.capacity = def.block_capacity;
            next.insert(def.id, blocks);
        }
        self.types = next;
    }

    pub fn capacity(&self, type_id: u16) -> Result<u32> {
        Ok(self.type_blocks(type_id)?.capacity)
    }

    pub fn get(&self, key: u64) -> Result<Option<BlockState>> {
        let (type_id, start) = split_key(key);
        Ok(self.type_blocks(type_id)?.blocks.get(&start).copied())
    }

    /// Set hash and residency of a block, creating it when absent.
    pub fn update(&mut self, key: u64, hash: Hash, inmem: bool) -> Result<()> {
        let (type_id, start) = split_key(key);
        let state = self.type_blocks_mut(type_id)?.blocks.entry(start).or_default();
        state.hash = hash;
        state.inmem = inmem;
        Ok(())
    }

    pub fn remove(&mut self, key: u64) -> Result<Option<BlockState>> {
        let (type_id, start) = split_key(key);
        Ok(self.type_blocks_mut(type_id)?.blocks.remove(&start))
    }

    /// Flag a block as changed; creates an in-memory block when absent.
    pub fn mark_dirty(&mut self, key: u64) -> Result<()> {
        let (type_id, start) = split_key(key);
        self.type_blocks_mut(type_id)?.blocks.entry(start).or_default().dirty = true;
        Ok(())
    }

    pub fn mark_clean(&mut self, key: u64) -> Result<()> {
        let (type_id, start) = split_key(key);
        if let Some(state) = self.type_blocks_mut(type_id)?.blocks.get_mut(&start) {
            state.dirty = false;
        }
        Ok(())
    }

    pub fn is_loaded(&self, key: u64) -> Result<bool> {
        Ok(self.get(key)?.map_or(true, |s| s.inmem))
    }

    /// Every dirty block, with `end` derived from the type's capacity now.
    pub fn dirty_blocks(&self) -> Vec<DirtyBlock> {
        let mut out = Vec::new();
        for (type_id, t) in &self.types {
            for (start, state) in t.blocks.iter().filter(|(_, s)| s.dirty) {
                out.push(DirtyBlock {
                    type_id: *type_id,
                    start: *start,
                    end: block_end(*start, t.capacity),
                    state: *state,
                });
            }
        }
        out
    }

    pub fn dirty_types(&self) -> Vec<u16> {
        self.types
            .iter()
            .filter(|(_, t)| t.blocks.values().any(|s| s.dirty))
            .map(|(id, _)| *id)
            .collect()
    }

    /// `(key, state)` of every block in key order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &BlockState)> {
        self.types
            .iter()
            .flat_map(|(type_id, t)| t.blocks.iter().map(move |(start, s)| (block_key(*type_id, *start), s)))
    }

    pub fn blocks_of(&self, type_id: u16) -> Result<Vec<(u32, BlockState)>> {
        Ok(self.type_blocks(type_id)?.blocks.iter().map(|(s, b)| (*s, *b)).collect())
    }

    pub fn len(&self) -> usize {
        self.types.values().map(|t| t.blocks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Digest of every block hash in iteration order.
    pub fn hash(&self) -> Hash {
        let mut digest = RunningDigest::new();
        for (_, state) in self.iter() {
            digest.update(&state.hash);
        }
        digest.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedb_core::config::SchemaConfig;
    use basedb_core::{compile, PropSchema as P, Schema, TypeSchema as T};

    fn defs(with_tag: bool) -> TypeDefs {
        let mut schema = Schema::new().with_type(T::new("user").prop(P::uint32("flap")).block_capacity(3));
        if with_tag {
            schema = schema.with_type(T::new("tag").prop(P::string("label")));
        }
        compile(&schema, &SchemaConfig::default()).unwrap()
    }

    #[test]
    fn test_dirty_lifecycle() {
        let defs = defs(false);
        let user = defs.get("user").unwrap().id;
        let mut map = BlockMap::new(&defs);
        let key = block_key(user, 4);

        map.mark_dirty(key).unwrap();
        let dirty = map.dirty_blocks();
        assert_eq!(dirty.len(), 1);
        assert_eq!((dirty[0].start, dirty[0].end), (4, 6));
        assert_eq!(map.dirty_types(), vec![user]);

        map.update(key, [7u8; 32], true).unwrap();
        map.mark_clean(key).unwrap();
        assert!(map.dirty_blocks().is_empty());
        assert_eq!(map.get(key).unwrap().unwrap().hash, [7u8; 32]);
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let mut map = BlockMap::new(&defs(false));
        let err = map.update(block_key(999, 1), EMPTY_HASH, true).unwrap_err();
        assert_eq!(err.error_code(), "TYPE_NOT_FOUND");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_update_types_keeps_surviving_types() {
        let with_tag = defs(true);
        let mut map = BlockMap::new(&with_tag);
        let user = with_tag.get("user").unwrap().id;
        let tag = with_tag.get("tag").unwrap().id;
        map.update(block_key(user, 1), [1u8; 32], true).unwrap();
        map.update(block_key(tag, 1), [2u8; 32], true).unwrap();
        let before = map.hash();

        map.update_types(&defs(false));
        assert_eq!(map.len(), 1);
        assert!(map.get(block_key(user, 1)).unwrap().is_some());
        assert!(map.get(block_key(tag, 1)).is_err());
        assert_ne!(map.hash(), before);
    }

    #[test]
    fn test_update_is_idempotent() {
        let defs = defs(false);
        let user = defs.get("user").unwrap().id;
        let mut map = BlockMap::new(&defs);
        map.update(block_key(user, 1), [3u8; 32], false).unwrap();
        let h = map.hash();
        map.update(block_key(user, 1), [3u8; 32], false).unwrap();
        assert_eq!(map.hash(), h);
        assert!(!map.is_loaded(block_key(user, 1)).unwrap());
    }
}
