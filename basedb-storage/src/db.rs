//! # Database state
//!
//! Everything the backend owns, behind one lock in [`DbServer`](crate::DbServer):
//! the compiled schema, node stores, block map and CSMT.
//!
//! ```text
//!                ┌──────────────┐
//!  modify ──────>│   TypeStore  │── dirty ──> BlockMap ──save──> *.sdb
//!  query  <──────│  (per type)  │                 │
//!                └──────────────┘                 └─ hashes ──> Csmt
//! ```
//!
//! Block file reads happen under the lock (they are small and rare);
//! writes are prepared under the lock and performed after it is released.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use basedb_core::block::{block_end, block_key, block_key_for, split_key};
use basedb_core::compression::{BlockCompressor, CompressionType};
use basedb_core::config::StorageConfig;
use basedb_core::hash::{Blake3Hasher, ContentHasher, Hash, EMPTY_HASH};
use basedb_core::metrics::Metrics;
use basedb_core::string::StringCodec;
use basedb_core::{Error, NodeId, Result, TypeDef, TypeDefs};

use crate::block_map::BlockMap;
use crate::csmt::Csmt;
use crate::dump::{self, DumpInfo, COMMON_FILE};
use crate::store::{decode_block, encode_block, BlockNodes, TypeStore};
use crate::writelog::{BlockEntry, LogLevel, TypeEntry, WriteLog};

/// A block prepared for writing by [`Db::prepare_save`].
#[derive(Debug)]
pub struct PendingDump {
    pub key: u64,
    pub info: DumpInfo,
    /// Dump file bytes; `None` when the block emptied and its file goes away.
    pub bytes: Option<Vec<u8>>,
}

/// Everything one save writes.
#[derive(Debug)]
pub struct SavePlan {
    pub dumps: Vec<PendingDump>,
    pub common: Vec<u8>,
    pub log: WriteLog,
}

pub struct Db {
    pub(crate) defs: Arc<TypeDefs>,
    pub(crate) types: BTreeMap<u16, TypeStore>,
    pub(crate) blocks: BlockMap,
    pub(crate) tree: Csmt,
    pub(crate) codec: StringCodec,
    pub(crate) metrics: Metrics,
    pub(crate) log: WriteLog,
    dir: PathBuf,
    compression: CompressionType,
    level: i32,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dir", &self.dir)
            .field("types", &self.types.len())
            .field("blocks", &self.blocks.len())
            .field("tree", &self.tree)
            .finish()
    }
}

impl Db {
    pub fn new(defs: Arc<TypeDefs>, config: &StorageConfig, string_threshold: usize, metrics: Metrics) -> Self {
        // Field compression is part of the wire format and does not follow
        // the dump compression setting.
        let mut db = Self {
            blocks: BlockMap::new(&defs),
            types: BTreeMap::new(),
            tree: Csmt::new(),
            codec: StringCodec::new(Arc::new(BlockCompressor::default()), string_threshold),
            metrics,
            log: WriteLog::default(),
            dir: config.data_dir.clone(),
            compression: config.compression.algorithm.into(),
            level: config.compression.level,
            defs,
        };
        db.sync_stores();
        db
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn defs(&self) -> &Arc<TypeDefs> {
        &self.defs
    }

    pub fn blocks(&self) -> &BlockMap {
        &self.blocks
    }

    pub fn root_hash(&self) -> Hash {
        self.tree.root_hash()
    }

    pub fn tree(&self) -> &Csmt {
        &self.tree
    }

    /// Create stores for new user types, drop stores of removed ones.
    pub(crate) fn sync_stores(&mut self) {
        let mut next = BTreeMap::new();
        for def in self.defs.types() {
            let store = self
                .types
                .remove(&def.id)
                .unwrap_or_else(|| TypeStore::new(def.id, def.block_capacity));
            next.insert(def.id, store);
        }
        self.types = next;
        self.blocks.update_types(&self.defs);
    }

    pub fn store(&self, type_id: u16) -> Result<&TypeStore> {
        self.types.get(&type_id).ok_or_else(|| Error::type_not_found(type_id))
    }

    pub fn store_mut(&mut self, type_id: u16) -> Result<&mut TypeStore> {
        self.types.get_mut(&type_id).ok_or_else(|| Error::type_not_found(type_id))
    }

    pub fn last_ids(&self) -> BTreeMap<u16, u32> {
        self.types.iter().map(|(id, s)| (*id, s.last_id)).collect()
    }

    /// Loaded node count of a type.
    pub fn count(&self, type_id: u16) -> Result<usize> {
        Ok(self.store(type_id)?.len())
    }

    fn capacity(&self, type_id: u16) -> Result<u32> {
        self.blocks.capacity(type_id)
    }

    pub(crate) fn mark_dirty(&mut self, type_id: u16, id: NodeId) -> Result<()> {
        let key = block_key_for(type_id, self.capacity(type_id)?, id);
        self.blocks.mark_dirty(key)
    }

    /// Load the block holding `id` if it was offloaded.
    pub(crate) fn ensure_loaded(&mut self, type_id: u16, id: NodeId) -> Result<()> {
        let capacity = self.capacity(type_id)?;
        let key = block_key_for(type_id, capacity, id);
        if self.blocks.is_loaded(key)? {
            return Ok(());
        }
        let (_, start) = split_key(key);
        self.load_block(type_id, start).map(|_| ())
    }

    fn dump_info(&self, type_id: u16, start: u32) -> Result<DumpInfo> {
        Ok(DumpInfo {
            type_id,
            start,
            end: block_end(start, self.capacity(type_id)?),
        })
    }

    /// Read a block dump into memory. Returns the number of nodes loaded.
    pub fn load_block(&mut self, type_id: u16, start: u32) -> Result<usize> {
        let key = block_key(type_id, start);
        let state = self.blocks.get(key)?;
        if state.map_or(false, |s| s.inmem) {
            return Ok(0);
        }
        let info = self.dump_info(type_id, start)?;
        let path = info.path(&self.dir);
        let (header, payload) = dump::read_dump(&path)?;
        if header != info {
            return Err(Error::malformed("dump", format!("{} holds {:?}", path.display(), header)));
        }
        let hash = Blake3Hasher.hash(&payload);
        if let Some(state) = state {
            if state.hash != EMPTY_HASH && state.hash != hash {
                return Err(Error::malformed("dump", format!("{} does not match its recorded hash", path.display())));
            }
        }
        let nodes = decode_block(&payload)?;
        let count = nodes.len();

        let def = self.defs.require_id(type_id)?.clone();
        let codec = self.codec.clone();
        let store = self.store_mut(type_id)?;
        store.index_aliases(&def, &codec, &nodes, true);
        store.put_block(start, nodes);
        self.blocks.update(key, hash, true)?;
        self.metrics.record_block_loaded();
        debug!(type_id, start, count, "loaded block");
        Ok(count)
    }

    /// Drop a clean block from memory. Dirty blocks have to be saved first.
    pub fn unload_block(&mut self, type_id: u16, start: u32) -> Result<usize> {
        let key = block_key(type_id, start);
        let Some(state) = self.blocks.get(key)? else {
            return Ok(0);
        };
        if !state.inmem {
            return Ok(0);
        }
        if state.dirty {
            return Err(Error::Configuration {
                message: format!("block {}:{} has unsaved changes", type_id, start),
            });
        }
        let def = self.defs.require_id(type_id)?.clone();
        let codec = self.codec.clone();
        let store = self.store_mut(type_id)?;
        let nodes = store.take_block(start).unwrap_or_default();
        store.index_aliases(&def, &codec, &nodes, false);
        self.blocks.update(key, state.hash, false)?;
        self.metrics.record_block_unloaded();
        debug!(type_id, start, count = nodes.len(), "unloaded block");
        Ok(nodes.len())
    }

    /// Register or load every dump in the data directory.
    pub fn open_dumps(&mut self, log: Option<WriteLog>, no_load_dumps: bool) -> Result<()> {
        let common = self.dir.join(COMMON_FILE);
        if common.exists() {
            for (type_id, last) in dump::decode_common(&std::fs::read(&common)?)? {
                if let Some(store) = self.types.get_mut(&type_id) {
                    store.last_id = store.last_id.max(last);
                }
            }
        }

        let recorded: BTreeMap<u64, Hash> = log
            .as_ref()
            .map(|l| {
                l.blocks
                    .iter()
                    .filter_map(|b| b.hash().ok().map(|h| (block_key(b.type_id, b.start), h)))
                    .collect()
            })
            .unwrap_or_default();

        for info in dump::list_dumps(&self.dir)? {
            if !self.types.contains_key(&info.type_id) || self.capacity(info.type_id)? != info.end - info.start + 1 {
                warn!(file = %info.file_name(), "skipping dump of unknown type or capacity");
                continue;
            }
            let key = block_key(info.type_id, info.start);
            let hash = match recorded.get(&key) {
                Some(h) => *h,
                None => Blake3Hasher.hash(&dump::read_dump(&info.path(&self.dir))?.1),
            };
            self.blocks.update(key, hash, false)?;
            if !no_load_dumps {
                self.load_block(info.type_id, info.start)?;
            }
        }

        self.tree = Csmt::from_leaves(self.blocks.iter().map(|(k, s)| (k, s.hash)))?;
        if let Some(log) = log {
            match log.root_hash() {
                Ok(root) if root != self.tree.root_hash() => {
                    warn!(
                        recorded = %log.root,
                        computed = %basedb_core::hash::to_hex(&self.tree.root_hash()),
                        "root hash differs from write log"
                    );
                }
                _ => {}
            }
            self.log = log;
        }
        info!(blocks = self.blocks.len(), loaded = !no_load_dumps, "opened dumps");
        Ok(())
    }

    /// Encode every dirty block and mark it clean. The caller writes the
    /// result and calls [`Db::save_failed`] for dumps it could not write.
    pub fn prepare_save(&mut self) -> Result<SavePlan> {
        let mut dumps = Vec::new();
        let mut rebuild = false;

        for dirty in self.blocks.dirty_blocks() {
            let key = block_key(dirty.type_id, dirty.start);
            let info = DumpInfo {
                type_id: dirty.type_id,
                start: dirty.start,
                end: dirty.end,
            };
            let nodes: Option<&BlockNodes> = self
                .types
                .get(&dirty.type_id)
                .and_then(|s| s.block(dirty.start))
                .filter(|b| !b.is_empty());

            match nodes {
                Some(nodes) => {
                    let payload = encode_block(nodes);
                    let hash = Blake3Hasher.hash(&payload);
                    let bytes = dump::encode_dump(info, &payload, self.compression, self.level)?;
                    self.blocks.update(key, hash, true)?;
                    self.blocks.mark_clean(key)?;
                    if self.tree.contains(key) {
                        self.tree.update(key, hash)?;
                    } else if self.tree.max_key().map_or(true, |max| key > max) {
                        // Appending past the max key keeps the canonical shape.
                        self.tree.insert(key, hash)?;
                    } else {
                        rebuild = true;
                    }
                    dumps.push(PendingDump {
                        key,
                        info,
                        bytes: Some(bytes),
                    });
                }
                None => {
                    self.blocks.remove(key)?;
                    rebuild |= self.tree.contains(key);
                    dumps.push(PendingDump { key, info, bytes: None });
                }
            }
        }
        if rebuild {
            self.tree = Csmt::from_leaves(self.blocks.iter().map(|(k, s)| (k, s.hash)))?;
        }

        let common = dump::encode_common(&self.last_ids())?;
        let root = self.tree.root_hash();
        self.log.version += 1;
        self.log.schema_hash = self.defs.hash;
        self.log.set_root(&root);
        self.log.types = self
            .defs
            .types()
            .map(|d| {
                (
                    d.id,
                    TypeEntry {
                        name: d.name.clone(),
                        last_id: self.types.get(&d.id).map_or(0, |s| s.last_id),
                        block_capacity: d.block_capacity,
                    },
                )
            })
            .collect();
        self.log.blocks = self
            .blocks
            .iter()
            .map(|(key, state)| {
                let (type_id, start) = split_key(key);
                let capacity = self.blocks.capacity(type_id).unwrap_or(1);
                BlockEntry {
                    type_id,
                    start,
                    end: block_end(start, capacity),
                    hash: basedb_core::hash::to_hex(&state.hash),
                }
            })
            .collect();
        if !dumps.is_empty() {
            self.log.record(
                LogLevel::Info,
                "save",
                format!("saved {} blocks", dumps.len()),
                Some(basedb_core::hash::to_hex(&root)),
            );
        }
        Ok(SavePlan {
            dumps,
            common,
            log: self.log.clone(),
        })
    }

    /// Put a block whose dump failed to write back into the dirty set.
    pub fn save_failed(&mut self, key: u64) {
        if let Err(e) = self.blocks.mark_dirty(key) {
            warn!(key, error = %e, "could not re-dirty block");
        }
    }

    /// Recompute the hash of every loaded clean block and the CSMT root.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for (key, state) in self.blocks.iter() {
            if !state.inmem {
                report.skipped += 1;
                continue;
            }
            if state.dirty {
                report.dirty += 1;
                continue;
            }
            let (type_id, start) = split_key(key);
            let hash = self
                .types
                .get(&type_id)
                .and_then(|s| s.block(start))
                .map(|nodes| Blake3Hasher.hash(&encode_block(nodes)))
                .unwrap_or(EMPTY_HASH);
            report.checked += 1;
            if hash != state.hash {
                report.mismatched.push(key);
            }
        }
        let rebuilt = Csmt::from_leaves(self.blocks.iter().filter(|(_, s)| !s.dirty).map(|(k, s)| (k, s.hash)))?;
        report.root_matches = self.blocks.dirty_blocks().is_empty() && rebuilt.root_hash() == self.tree.root_hash();
        Ok(report)
    }

    pub(crate) fn require_def(&self, type_id: u16) -> Result<&TypeDef> {
        self.defs.require_id(type_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub checked: usize,
    pub skipped: usize,
    pub dirty: usize,
    /// Keys of loaded blocks whose content no longer matches their hash.
    pub mismatched: Vec<u64>,
    pub root_matches: bool,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.mismatched.is_empty() && self.root_matches
    }
}
