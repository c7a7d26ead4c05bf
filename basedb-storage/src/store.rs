//! # In-memory node store
//!
//! Nodes of one type, grouped by block so a block can be dumped, hashed and
//! evicted as a unit.
//!
//! ```text
//! TypeStore
//!   blocks: start → { id → Node }
//!   aliases: alias prop → { normalized value → id }
//!
//! Node
//!   main:   fixed-size record (schema layout)
//!   fields: prop id → Field
//! ```
//!
//! ## Block encoding
//!
//! ```text
//! block := count:u32 node*
//! node  := id:u32 body
//! body  := main_len:u16 main fields:u8 (prop:u8 tag:u8 payload)*
//! ```
//!
//! | tag | payload                                          |
//! |-----|--------------------------------------------------|
//! | 0   | len:u32 bytes                                    |
//! | 1   | count:u8 (locale_len:u8 locale len:u32 bytes)*   |
//! | 2   | count:u32 hash:u64*                              |
//! | 3   | ref                                              |
//! | 4   | count:u32 ref*                                   |
//!
//! `ref := id:u32 has_edge:u8 body?`

use std::collections::{BTreeMap, BTreeSet, HashMap};

use basedb_core::block::block_start;
use bytes::BufMut;

use basedb_core::codec::ByteReader;
use basedb_core::hash::{Blake3Hasher, ContentHasher, Hash};
use basedb_core::string::StringCodec;
use basedb_core::{Error, NodeId, Result, TypeDef};

const WHAT: &str = "block";

const TAG_BYTES: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_CARDINALITY: u8 = 2;
const TAG_REFERENCE: u8 = 3;
const TAG_REFERENCES: u8 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub main: Vec<u8>,
    pub fields: BTreeMap<u8, Field>,
}

impl Node {
    pub fn new(main: Vec<u8>) -> Self {
        Self {
            main,
            fields: BTreeMap::new(),
        }
    }

    /// Target ids of a reference field, in list order.
    pub fn ref_ids(&self, prop: u8) -> Vec<NodeId> {
        match self.fields.get(&prop) {
            Some(Field::Reference(e)) => vec![e.id],
            Some(Field::References(list)) => list.iter().map(|e| e.id).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Encoded string, json, binary or vector bytes.
    Bytes(Vec<u8>),
    /// locale → encoded string
    Text(BTreeMap<String, Vec<u8>>),
    Cardinality(BTreeSet<u64>),
    Reference(RefEntry),
    References(Vec<RefEntry>),
}

/// One reference target and the edge properties stored with it.
#[derive(Debug, Clone, PartialEq)]
pub struct RefEntry {
    pub id: NodeId,
    pub edge: Option<Box<Node>>,
}

impl RefEntry {
    pub fn new(id: NodeId) -> Self {
        Self { id, edge: None }
    }
}

pub type BlockNodes = BTreeMap<NodeId, Node>;

/// Nodes and alias index of one type.
#[derive(Debug, Clone)]
pub struct TypeStore {
    pub type_id: u16,
    pub capacity: u32,
    pub last_id: u32,
    blocks: BTreeMap<u32, BlockNodes>,
    aliases: BTreeMap<u8, HashMap<String, NodeId>>,
}

impl TypeStore {
    pub fn new(type_id: u16, capacity: u32) -> Self {
        Self {
            type_id,
            capacity,
            last_id: 0,
            blocks: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn start_of(&self, id: NodeId) -> u32 {
        block_start(id, self.capacity)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.blocks.get(&self.start_of(id))?.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let start = self.start_of(id);
        self.blocks.get_mut(&start)?.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn insert(&mut self, id: NodeId, node: Node) {
        let start = self.start_of(id);
        self.blocks.entry(start).or_default().insert(id, node);
        self.last_id = self.last_id.max(id);
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        let start = self.start_of(id);
        let block = self.blocks.get_mut(&start)?;
        let node = block.remove(&id);
        if block.is_empty() {
            self.blocks.remove(&start);
        }
        node
    }

    /// Loaded nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.blocks.values().flat_map(|b| b.iter().map(|(id, n)| (*id, n)))
    }

    pub fn len(&self) -> usize {
        self.blocks.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, start: u32) -> Option<&BlockNodes> {
        self.blocks.get(&start)
    }

    pub fn block_starts(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.keys().copied()
    }

    pub fn put_block(&mut self, start: u32, nodes: BlockNodes) {
        if let Some(last) = nodes.keys().next_back() {
            self.last_id = self.last_id.max(*last);
        }
        if nodes.is_empty() {
            self.blocks.remove(&start);
        } else {
            self.blocks.insert(start, nodes);
        }
    }

    pub fn take_block(&mut self, start: u32) -> Option<BlockNodes> {
        self.blocks.remove(&start)
    }

    pub fn alias(&self, prop: u8, value: &str) -> Option<NodeId> {
        self.aliases.get(&prop)?.get(value).copied()
    }

    pub fn set_alias(&mut self, prop: u8, value: String, id: NodeId) {
        self.aliases.entry(prop).or_default().insert(value, id);
    }

    /// Drop `value` from the index if it still points at `id`.
    pub fn clear_alias(&mut self, prop: u8, value: &str, id: NodeId) {
        if let Some(index) = self.aliases.get_mut(&prop) {
            if index.get(value) == Some(&id) {
                index.remove(value);
            }
        }
    }

    pub fn reset_aliases(&mut self) {
        self.aliases.clear();
    }

    /// Add or remove the aliases of `nodes` from the index.
    pub fn index_aliases(&mut self, def: &TypeDef, codec: &StringCodec, nodes: &BlockNodes, add: bool) {
        for p in def.alias_props() {
            for (id, node) in nodes {
                let Some(Field::Bytes(data)) = node.fields.get(&p.prop) else { continue };
                let Ok(value) = codec.decode(data) else { continue };
                if add {
                    self.set_alias(p.prop, value, *id);
                } else {
                    self.clear_alias(p.prop, &value, *id);
                }
            }
        }
    }
}

// Block encoding

pub fn encode_block(nodes: &BlockNodes) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 * nodes.len().max(1));
    buf.put_u32_le(nodes.len() as u32);
    for (id, node) in nodes {
        buf.put_u32_le(*id);
        put_node(&mut buf, node);
    }
    buf
}

pub fn decode_block(data: &[u8]) -> Result<BlockNodes> {
    let mut r = ByteReader::new(data, WHAT);
    let count = r.u32()?;
    let mut nodes = BTreeMap::new();
    for _ in 0..count {
        let id = r.u32()?;
        nodes.insert(id, read_node(&mut r)?);
    }
    if !r.is_empty() {
        return Err(Error::malformed(WHAT, format!("{} trailing bytes", r.remaining())));
    }
    Ok(nodes)
}

/// Content hash of a block as it would be dumped.
pub fn block_hash(nodes: &BlockNodes) -> Hash {
    Blake3Hasher.hash(&encode_block(nodes))
}

fn put_node(buf: &mut Vec<u8>, node: &Node) {
    buf.put_u16_le(node.main.len() as u16);
    buf.put_slice(&node.main);
    buf.put_u8(node.fields.len() as u8);
    for (prop, field) in &node.fields {
        buf.put_u8(*prop);
        match field {
            Field::Bytes(data) => {
                buf.put_u8(TAG_BYTES);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            Field::Text(locales) => {
                buf.put_u8(TAG_TEXT);
                buf.put_u8(locales.len() as u8);
                for (locale, data) in locales {
                    buf.put_u8(locale.len() as u8);
                    buf.put_slice(locale.as_bytes());
                    buf.put_u32_le(data.len() as u32);
                    buf.put_slice(data);
                }
            }
            Field::Cardinality(hashes) => {
                buf.put_u8(TAG_CARDINALITY);
                buf.put_u32_le(hashes.len() as u32);
                for h in hashes {
                    buf.put_u64_le(*h);
                }
            }
            Field::Reference(entry) => {
                buf.put_u8(TAG_REFERENCE);
                put_ref(buf, entry);
            }
            Field::References(list) => {
                buf.put_u8(TAG_REFERENCES);
                buf.put_u32_le(list.len() as u32);
                for entry in list {
                    put_ref(buf, entry);
                }
            }
        }
    }
}

fn put_ref(buf: &mut Vec<u8>, entry: &RefEntry) {
    buf.put_u32_le(entry.id);
    match &entry.edge {
        Some(edge) => {
            buf.put_u8(1);
            put_node(buf, edge);
        }
        None => buf.put_u8(0),
    }
}

fn read_node(r: &mut ByteReader<'_>) -> Result<Node> {
    let main_len = r.u16()? as usize;
    let mut node = Node::new(r.bytes(main_len)?.to_vec());
    for _ in 0..r.u8()? {
        let prop = r.u8()?;
        let field = match r.u8()? {
            TAG_BYTES => {
                let len = r.u32()? as usize;
                Field::Bytes(r.bytes(len)?.to_vec())
            }
            TAG_TEXT => {
                let mut locales = BTreeMap::new();
                for _ in 0..r.u8()? {
                    let len = r.u8()? as usize;
                    let locale = String::from_utf8(r.bytes(len)?.to_vec()).map_err(|e| Error::malformed(WHAT, e.to_string()))?;
                    let len = r.u32()? as usize;
                    locales.insert(locale, r.bytes(len)?.to_vec());
                }
                Field::Text(locales)
            }
            TAG_CARDINALITY => {
                let mut hashes = BTreeSet::new();
                for _ in 0..r.u32()? {
                    hashes.insert(r.u64()?);
                }
                Field::Cardinality(hashes)
            }
            TAG_REFERENCE => Field::Reference(read_ref(r)?),
            TAG_REFERENCES => {
                let count = r.u32()? as usize;
                let mut list = Vec::with_capacity(count.min(r.remaining() / 5));
                for _ in 0..count {
                    list.push(read_ref(r)?);
                }
                Field::References(list)
            }
            other => return Err(Error::malformed(WHAT, format!("unknown field tag {}", other))),
        };
        node.fields.insert(prop, field);
    }
    Ok(node)
}

fn read_ref(r: &mut ByteReader<'_>) -> Result<RefEntry> {
    let id = r.u32()?;
    let edge = match r.u8()? {
        0 => None,
        _ => Some(Box::new(read_node(r)?)),
    };
    Ok(RefEntry { id, edge })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockNodes {
        let mut a = Node::new(vec![1, 2, 3, 4]);
        a.fields.insert(1, Field::Bytes(b"hello".to_vec()));
        a.fields.insert(
            2,
            Field::Text(BTreeMap::from([("en".to_string(), b"hi".to_vec()), ("de".to_string(), b"hallo".to_vec())])),
        );
        a.fields.insert(3, Field::Cardinality(BTreeSet::from([7, 9])));
        let mut edge = Node::new(vec![5, 0, 0, 0]);
        edge.fields.insert(1, Field::Bytes(b"x".to_vec()));
        a.fields.insert(
            4,
            Field::References(vec![
                RefEntry {
                    id: 2,
                    edge: Some(Box::new(edge)),
                },
                RefEntry::new(3),
            ]),
        );
        let mut b = Node::new(vec![0; 4]);
        b.fields.insert(5, Field::Reference(RefEntry::new(1)));
        BTreeMap::from([(1, a), (2, b)])
    }

    #[test]
    fn test_block_encoding_is_lossless() {
        let nodes = sample();
        let bytes = encode_block(&nodes);
        assert_eq!(decode_block(&bytes).unwrap(), nodes);
        assert_eq!(block_hash(&nodes), block_hash(&decode_block(&bytes).unwrap()));
    }

    #[test]
    fn test_corrupt_block_is_rejected() {
        let bytes = encode_block(&sample());
        assert!(decode_block(&bytes[..bytes.len() - 3]).is_err());
        let mut extra = bytes.clone();
        extra.push(0);
        assert!(decode_block(&extra).is_err());
    }

    #[test]
    fn test_type_store_blocks() {
        let mut store = TypeStore::new(1, 3);
        for id in 1..=7 {
            store.insert(id, Node::new(vec![id as u8]));
        }
        assert_eq!(store.block_starts().collect::<Vec<_>>(), vec![1, 4, 7]);
        assert_eq!(store.last_id, 7);
        assert_eq!(store.remove(7).unwrap().main, vec![7]);
        assert_eq!(store.block_starts().collect::<Vec<_>>(), vec![1, 4]);

        let block = store.take_block(4).unwrap();
        assert_eq!(block.len(), 3);
        assert!(store.get(5).is_none());
        store.put_block(4, block);
        assert_eq!(store.get(5).unwrap().main, vec![5]);
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_alias_index_only_clears_its_owner() {
        let mut store = TypeStore::new(1, 10);
        store.set_alias(3, "a@b.c".into(), 1);
        store.clear_alias(3, "a@b.c", 2);
        assert_eq!(store.alias(3, "a@b.c"), Some(1));
        store.clear_alias(3, "a@b.c", 1);
        assert_eq!(store.alias(3, "a@b.c"), None);
    }
}
