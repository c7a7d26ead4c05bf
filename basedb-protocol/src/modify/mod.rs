//! # Modify byte-code
//!
//! ```text
//! batch   := schema_hash:u64 instr* trailer instr_len:u32
//! instr   := SWITCH_TYPE type:u16
//!          | CREATE id:u32 block* NODE_END
//!          | UPDATE id:u32 block* NODE_END
//!          | UPSERT|INSERT alias_prop:u8 alias_len:u16 alias id:u32 block* NODE_END
//!          | DELETE id:u32
//! block   := MAIN len:u16 bytes
//!          | PARTIAL_MAIN count:u16 (start:u16 size:u16)* bytes
//!          | INCREMENT start:u16 kind:u8 delta:f64
//!          | FIELD prop:u8 len:u32 bytes
//!          | TEXT prop:u8 locale_len:u8 locale len:u32 bytes
//!          | CARDINALITY prop:u8 count:u32 hash:u64*
//!          | DELETE_FIELD prop:u8
//!          | REFERENCE prop:u8 len:u32 body
//!          | REFERENCES prop:u8 len:u32 (op:u8 len:u32 body)*
//! trailer := dirty_types:u16 (type:u16 start:u32 last:u32)* dirty_ranges:u32 (key:f64)*
//! ```
//!
//! Ids written for created nodes are client-local: the backend shifts them by
//! a per-type offset it reports back from the flush.

mod ctx;
mod parse;
mod serialize;

pub use ctx::{ModifyCtx, ModifyMark};
pub use parse::{parse_batch, Block, EdgeItem, Instr, InstrIter, ModifyBatch, RefOp, Trailer};
pub use serialize::{serialize_create, serialize_delete, serialize_insert, serialize_update, serialize_upsert};

use basedb_core::{NodeId, Value};

pub const NODE_END: u8 = 0;
pub const SWITCH_TYPE: u8 = 1;
pub const CREATE: u8 = 2;
pub const UPDATE: u8 = 3;
pub const UPSERT: u8 = 4;
pub const INSERT: u8 = 5;
pub const DELETE: u8 = 6;

pub const MAIN: u8 = 10;
pub const PARTIAL_MAIN: u8 = 11;
pub const INCREMENT: u8 = 12;
pub const FIELD: u8 = 13;
pub const TEXT: u8 = 14;
pub const CARDINALITY: u8 = 15;
pub const DELETE_FIELD: u8 = 16;
pub const REFERENCE: u8 = 17;
pub const REFERENCES: u8 = 18;

/// Sub-operations of a `REFERENCES` block.
pub const REF_IDS: u8 = 0;
pub const REF_TMP_IDS: u8 = 1;
pub const REF_IDS_WITH_META: u8 = 2;
pub const REF_DEL_IDS: u8 = 3;
pub const REF_CLEAR: u8 = 4;

/// Placeholder for a node created earlier in the same, unflushed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TmpId {
    pub batch: u64,
    pub type_id: u16,
    /// Client-local id the node was created with.
    pub local: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefTarget {
    Id(NodeId),
    Tmp(TmpId),
}

impl From<NodeId> for RefTarget {
    fn from(id: NodeId) -> Self {
        RefTarget::Id(id)
    }
}

impl From<TmpId> for RefTarget {
    fn from(tmp: TmpId) -> Self {
        RefTarget::Tmp(tmp)
    }
}

/// One element of a reference list.
#[derive(Debug, Clone, PartialEq)]
pub enum RefItem {
    Id(NodeId),
    Tmp(TmpId),
    /// Target plus properties stored on the edge.
    WithEdges { target: RefTarget, edges: Payload },
    /// Target placed at an explicit position in the list.
    WithIndex { target: RefTarget, index: u32, edges: Payload },
}

impl RefItem {
    pub fn edges(target: impl Into<RefTarget>, edges: Payload) -> Self {
        RefItem::WithEdges {
            target: target.into(),
            edges,
        }
    }

    pub fn at(target: impl Into<RefTarget>, index: u32) -> Self {
        RefItem::WithIndex {
            target: target.into(),
            index,
            edges: Payload::new(),
        }
    }

    pub fn target(&self) -> RefTarget {
        match self {
            RefItem::Id(id) => RefTarget::Id(*id),
            RefItem::Tmp(t) => RefTarget::Tmp(*t),
            RefItem::WithEdges { target, .. } | RefItem::WithIndex { target, .. } => *target,
        }
    }
}

impl From<NodeId> for RefItem {
    fn from(id: NodeId) -> Self {
        RefItem::Id(id)
    }
}

impl From<TmpId> for RefItem {
    fn from(tmp: TmpId) -> Self {
        RefItem::Tmp(tmp)
    }
}

/// Changes to a `references` property.
#[derive(Debug, Clone, PartialEq)]
pub enum RefsInput {
    /// Replace the whole list.
    Set(Vec<RefItem>),
    Ops { add: Vec<RefItem>, delete: Vec<NodeId> },
}

/// Value of one property in a modify payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Value(Value),
    /// Server-side add.
    Increment(f64),
    /// Timestamp expression resolved at serialization time (`now + 1d`).
    Timestamp(String),
    Ref(Option<RefItem>),
    Refs(RefsInput),
}

macro_rules! impl_input_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Input {
            fn from(v: $t) -> Self {
                Input::Value(v.into())
            }
        })*
    };
}

impl_input_from!(i8, i16, i32, i64, u8, u16, u32, f64, bool, &str, String, Vec<f32>, Vec<u8>, serde_json::Value);

impl From<Value> for Input {
    fn from(v: Value) -> Self {
        Input::Value(v)
    }
}

/// Property changes of one node, in call order. Keys are dotted paths;
/// edge properties keep their `$` prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload {
    entries: Vec<(String, Input)>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, input: impl Into<Input>) -> Self {
        self.insert(path, input.into());
        self
    }

    pub fn increment(self, path: impl Into<String>, delta: f64) -> Self {
        self.set(path, Input::Increment(delta))
    }

    pub fn timestamp(self, path: impl Into<String>, expr: impl Into<String>) -> Self {
        self.set(path, Input::Timestamp(expr.into()))
    }

    pub fn reference(self, path: impl Into<String>, item: impl Into<RefItem>) -> Self {
        self.set(path, Input::Ref(Some(item.into())))
    }

    pub fn clear_reference(self, path: impl Into<String>) -> Self {
        self.set(path, Input::Ref(None))
    }

    pub fn references<I: Into<RefItem>>(self, path: impl Into<String>, items: impl IntoIterator<Item = I>) -> Self {
        let items = items.into_iter().map(Into::into).collect();
        self.set(path, Input::Refs(RefsInput::Set(items)))
    }

    pub fn add_references<I: Into<RefItem>>(self, path: impl Into<String>, items: impl IntoIterator<Item = I>) -> Self {
        let add = items.into_iter().map(Into::into).collect();
        self.set(path, Input::Refs(RefsInput::Ops { add, delete: Vec::new() }))
    }

    pub fn delete_references(self, path: impl Into<String>, ids: impl IntoIterator<Item = NodeId>) -> Self {
        let delete = ids.into_iter().collect();
        self.set(path, Input::Refs(RefsInput::Ops { add: Vec::new(), delete }))
    }

    /// Expand a nested object value into dotted paths.
    pub fn object(mut self, path: &str, row: basedb_core::Row) -> Self {
        for (k, v) in row {
            let p = format!("{}.{}", path, k);
            self = match v {
                Value::Object(inner) => self.object(&p, inner),
                v => self.set(p, v),
            };
        }
        self
    }

    /// Later writes to the same path replace earlier ones.
    pub fn insert(&mut self, path: impl Into<String>, input: Input) {
        let path = path.into();
        match self.entries.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = input,
            None => self.entries.push((path, input)),
        }
    }

    pub fn get(&self, path: &str) -> Option<&Input> {
        self.entries.iter().find(|(p, _)| p == path).map(|(_, i)| i)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Input)> {
        self.entries.iter().map(|(p, i)| (p.as_str(), i))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl From<basedb_core::Row> for Payload {
    fn from(row: basedb_core::Row) -> Self {
        let mut p = Payload::new();
        for (k, v) in row {
            p = match v {
                Value::Object(inner) => p.object(&k, inner),
                v => p.set(k, v),
            };
        }
        p
    }
}
