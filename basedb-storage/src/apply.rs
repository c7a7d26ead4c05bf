//! # Modify applier
//!
//! Executes a modify batch against [`Db`].
//!
//! The whole batch is parsed before anything is applied, so a malformed
//! buffer leaves the database untouched. Ids of nodes created by the batch
//! are client-local and are shifted by a per-type offset:
//!
//! ```text
//! offset(type) = server_last_id(type) - client_last_id_before_batch(type)
//! real id      = local id + offset
//! ```
//!
//! Relations are kept bidirectional. Every change to a reference field queues
//! an [`InverseOp`] that is replayed on the target node once the source node
//! is back in its store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use basedb_core::codec::*;
use basedb_core::schema::{default_main, encode_main, AutoTimestamp};
use basedb_core::timestamp::now_ms;
use basedb_core::{ChangeSet, Error, NodeId, PropDef, PropKind, Result, TypeDef, TypeDefs, Value};
use basedb_protocol::modify::{parse_batch, Block, EdgeItem, Instr, RefOp};

use crate::db::Db;
use crate::store::{Field, Node, RefEntry};

const WHAT: &str = "modify";

/// Result of an applied batch.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Per type created by the batch, the offset added to client-local ids.
    pub offsets: BTreeMap<u16, u32>,
    pub changes: ChangeSet,
    pub created: u64,
}

#[derive(Debug)]
enum InverseOp {
    Link {
        target_type: u16,
        target: NodeId,
        /// Inverse prop on the target type.
        prop: u8,
        source_type: u16,
        /// Forward prop on the source type.
        source_prop: u8,
        source: NodeId,
        edge: Option<Box<Node>>,
    },
    Unlink {
        target_type: u16,
        target: NodeId,
        prop: u8,
        source: NodeId,
    },
}

#[derive(Debug, Default)]
struct Changes {
    props: BTreeMap<u16, BTreeSet<u8>>,
    main: BTreeMap<u16, BTreeSet<(u16, u16)>>,
    structural: BTreeSet<u16>,
}

impl Changes {
    fn prop(&mut self, type_id: u16, prop: u8) {
        self.props.entry(type_id).or_default().insert(prop);
    }

    fn main(&mut self, type_id: u16, start: usize, len: usize) {
        self.main.entry(type_id).or_default().insert((start as u16, len as u16));
    }

    fn into_change_set(self) -> ChangeSet {
        ChangeSet {
            props: self.props.into_iter().map(|(t, p)| (t, p.into_iter().collect())).collect(),
            main: self.main.into_iter().map(|(t, m)| (t, m.into_iter().collect())).collect(),
            structural: self.structural.into_iter().collect(),
        }
    }
}

impl Db {
    /// Apply a modify buffer. `Ok(None)` means it was built against another
    /// schema and nothing was applied.
    pub fn apply_modify(&mut self, buf: &[u8]) -> Result<Option<ApplyOutcome>> {
        let batch = parse_batch(buf)?;
        if batch.schema_hash != self.defs.hash {
            self.metrics.record_schema_mismatch();
            debug!(
                batch = batch.schema_hash,
                active = self.defs.hash,
                "discarding modify built against another schema"
            );
            return Ok(None);
        }

        let mut instrs = Vec::new();
        let mut current: Option<u16> = None;
        for instr in batch.iter() {
            match instr? {
                Instr::SwitchType(type_id) => {
                    let def = self.defs.require_id(type_id)?;
                    if def.is_edge {
                        return Err(Error::malformed(WHAT, format!("{} is an edge type", def.name)));
                    }
                    current = Some(type_id);
                }
                other => {
                    let type_id = current.ok_or_else(|| Error::malformed(WHAT, "node instruction before SWITCH_TYPE"))?;
                    instrs.push((type_id, other));
                }
            }
        }

        let mut offsets = BTreeMap::new();
        for (type_id, start, last) in &batch.trailer.types {
            let store = self.store_mut(*type_id)?;
            let offset = store.last_id.saturating_sub(*start);
            store.last_id = store.last_id.max(last.saturating_add(offset));
            offsets.insert(*type_id, offset);
        }

        let defs = self.defs.clone();
        let mut applier = Applier {
            db: self,
            defs,
            offsets,
            changes: Changes::default(),
            inverse: Vec::new(),
            created: 0,
        };
        for (type_id, instr) in instrs {
            applier.instr(type_id, instr)?;
        }

        let Applier {
            offsets,
            changes,
            created,
            ..
        } = applier;
        self.metrics.record_modify(buf.len() as u64, created);
        Ok(Some(ApplyOutcome {
            offsets,
            changes: changes.into_change_set(),
            created,
        }))
    }
}

struct Applier<'a> {
    db: &'a mut Db,
    defs: Arc<TypeDefs>,
    offsets: BTreeMap<u16, u32>,
    changes: Changes,
    inverse: Vec<InverseOp>,
    created: u64,
}

impl Applier<'_> {
    fn real_id(&self, type_id: u16, local: NodeId) -> NodeId {
        local.saturating_add(self.offsets.get(&type_id).copied().unwrap_or(0))
    }

    fn exists(&mut self, type_id: u16, id: NodeId) -> Result<bool> {
        if id == 0 {
            return Ok(false);
        }
        self.db.ensure_loaded(type_id, id)?;
        Ok(self.db.store(type_id)?.contains(id))
    }

    fn instr(&mut self, type_id: u16, instr: Instr<'_>) -> Result<()> {
        let defs = self.defs.clone();
        let def = defs.require_id(type_id)?;
        match instr {
            Instr::SwitchType(_) => Ok(()),
            Instr::Create { id, blocks } => {
                let id = self.real_id(type_id, id);
                self.create(def, id, &blocks)
            }
            Instr::Update { id, blocks } => {
                if !self.exists(type_id, id)? {
                    debug!(type_name = %def.name, id, "update of missing node skipped");
                    return Ok(());
                }
                self.write_node(def, id, &blocks)
            }
            Instr::Upsert {
                alias_prop,
                alias,
                id,
                blocks,
            } => match self.find_alias(def, alias_prop, alias)? {
                Some(existing) => self.write_node(def, existing, &blocks),
                None => {
                    let id = self.real_id(type_id, id);
                    self.create_stamped(def, id, &blocks)
                }
            },
            Instr::Insert {
                alias_prop,
                alias,
                id,
                blocks,
            } => match self.find_alias(def, alias_prop, alias)? {
                Some(_) => Ok(()),
                None => {
                    let id = self.real_id(type_id, id);
                    self.create(def, id, &blocks)
                }
            },
            Instr::Delete { id } => self.delete(def, id),
        }
    }

    fn find_alias(&mut self, def: &TypeDef, prop: u8, alias: &str) -> Result<Option<NodeId>> {
        match def.by_prop_id(prop) {
            Some(p) if p.kind == PropKind::Alias => Ok(self.db.store(def.id)?.alias(prop, alias)),
            _ => Err(Error::malformed(WHAT, format!("{} has no alias prop {}", def.name, prop))),
        }
    }

    fn create(&mut self, def: &TypeDef, id: NodeId, blocks: &[Block<'_>]) -> Result<()> {
        self.create_node(def, id, blocks, default_main(def))
    }

    /// Create from an upsert. The client serialized it as an update, so the
    /// `on: create` timestamps are filled here; the payload's own values
    /// still win.
    fn create_stamped(&mut self, def: &TypeDef, id: NodeId, blocks: &[Block<'_>]) -> Result<()> {
        let mut main = default_main(def);
        let now = Value::Timestamp(now_ms());
        for p in def.auto_timestamps(AutoTimestamp::Create) {
            if p.on == Some(AutoTimestamp::Create) && !p.separate {
                encode_main(p, &now, &mut main)?;
            }
        }
        self.create_node(def, id, blocks, main)
    }

    fn create_node(&mut self, def: &TypeDef, id: NodeId, blocks: &[Block<'_>], main: Vec<u8>) -> Result<()> {
        if id == 0 {
            return Err(Error::malformed(WHAT, "node id 0 is reserved"));
        }
        if self.exists(def.id, id)? {
            debug!(type_name = %def.name, id, "create of existing node applied as update");
            return self.write_node(def, id, blocks);
        }
        self.db.store_mut(def.id)?.insert(id, Node::new(main));
        self.created += 1;
        self.changes.structural.insert(def.id);
        self.write_node(def, id, blocks)
    }

    /// Take the node out of its store, apply `blocks`, put it back and
    /// replay the queued inverse operations.
    fn write_node(&mut self, def: &TypeDef, id: NodeId, blocks: &[Block<'_>]) -> Result<()> {
        let Some(mut node) = self.db.store_mut(def.id)?.remove(id) else {
            return Ok(());
        };
        let result = blocks
            .iter()
            .try_for_each(|block| self.block(def, id, &mut node, block));
        self.db.store_mut(def.id)?.insert(id, node);
        self.db.mark_dirty(def.id, id)?;
        result?;
        self.flush_inverse()
    }

    fn block(&mut self, def: &TypeDef, id: NodeId, node: &mut Node, block: &Block<'_>) -> Result<()> {
        match block {
            Block::Reference { prop, is_tmp, id: target, edges } => {
                let p = separate_prop(def, *prop)?;
                self.reference(def, id, node, p, *is_tmp, *target, edges)
            }
            Block::References { prop, ops } => {
                let p = separate_prop(def, *prop)?;
                self.references(def, id, node, p, ops)
            }
            Block::DeleteField { prop } => {
                let p = separate_prop(def, *prop)?;
                if let Some(r) = &p.reference {
                    for target in node.ref_ids(p.prop) {
                        self.inverse.push(InverseOp::Unlink {
                            target_type: r.target_type_id,
                            target,
                            prop: r.inverse_prop_id,
                            source: id,
                        });
                    }
                }
                if p.kind == PropKind::Alias {
                    self.clear_alias(def, id, node, p.prop)?;
                }
                node.fields.remove(&p.prop);
                self.changes.prop(def.id, p.prop);
                Ok(())
            }
            Block::Field { prop, .. } => {
                let p = separate_prop(def, *prop)?;
                if p.kind == PropKind::Alias {
                    self.clear_alias(def, id, node, p.prop)?;
                }
                apply_value_block(def, node, block)?;
                if p.kind == PropKind::Alias {
                    if let Some(Field::Bytes(data)) = node.fields.get(&p.prop) {
                        let alias = self.db.codec.decode(data)?;
                        if !alias.is_empty() {
                            self.db.store_mut(def.id)?.set_alias(p.prop, alias, id);
                        }
                    }
                }
                self.changes.prop(def.id, p.prop);
                Ok(())
            }
            other => {
                apply_value_block(def, node, other)?;
                self.record(def.id, def, other);
                Ok(())
            }
        }
    }

    fn record(&mut self, type_id: u16, def: &TypeDef, block: &Block<'_>) {
        match block {
            Block::Main(_) => self.changes.main(type_id, 0, def.main_len),
            Block::PartialMain(slices) => {
                for (start, data) in slices {
                    self.changes.main(type_id, *start as usize, data.len());
                }
            }
            Block::Increment { start, kind, .. } => self.changes.main(type_id, *start as usize, kind.main_size()),
            Block::Field { prop, .. }
            | Block::Text { prop, .. }
            | Block::Cardinality { prop, .. }
            | Block::DeleteField { prop }
            | Block::Reference { prop, .. }
            | Block::References { prop, .. } => self.changes.prop(type_id, *prop),
        }
    }

    fn clear_alias(&mut self, def: &TypeDef, id: NodeId, node: &Node, prop: u8) -> Result<()> {
        if let Some(Field::Bytes(data)) = node.fields.get(&prop) {
            let old = self.db.codec.decode(data)?;
            self.db.store_mut(def.id)?.clear_alias(prop, &old, id);
        }
        Ok(())
    }

    /// Resolve a reference target; `None` when the node does not exist.
    fn target(&mut self, def: &TypeDef, source: NodeId, p: &PropDef, is_tmp: bool, id: NodeId) -> Result<Option<NodeId>> {
        let r = p.reference.as_ref().ok_or_else(|| unresolved(def, p))?;
        let id = if is_tmp { self.real_id(r.target_type_id, id) } else { id };
        // Self references: the source node is out of its store right now.
        if (r.target_type_id, id) == (def.id, source) || self.exists(r.target_type_id, id)? {
            return Ok(Some(id));
        }
        debug!(type_name = %def.name, prop = %p.path, target = id, "reference to missing node dropped");
        Ok(None)
    }

    /// Build or update the edge node stored with a reference.
    fn edge_node(&mut self, p: &PropDef, current: Option<Box<Node>>, blocks: &[Block<'_>]) -> Result<Option<Box<Node>>> {
        if blocks.is_empty() {
            return Ok(current);
        }
        let defs = self.defs.clone();
        let edge_def = defs
            .edge_def(p)
            .ok_or_else(|| Error::malformed(WHAT, format!("{} has no edge properties", p.path)))?;
        let mut edge = current.unwrap_or_else(|| Box::new(Node::new(default_main(edge_def))));
        for block in blocks {
            apply_value_block(edge_def, &mut edge, block)?;
        }
        Ok(Some(edge))
    }

    #[allow(clippy::too_many_arguments)]
    fn reference(
        &mut self,
        def: &TypeDef,
        id: NodeId,
        node: &mut Node,
        p: &PropDef,
        is_tmp: bool,
        target: NodeId,
        edges: &[Block<'_>],
    ) -> Result<()> {
        let r = p.reference.clone().ok_or_else(|| unresolved(def, p))?;
        let Some(target) = self.target(def, id, p, is_tmp, target)? else {
            return Ok(());
        };

        let current = match node.fields.remove(&p.prop) {
            Some(Field::Reference(entry)) if entry.id == target => entry.edge,
            Some(Field::Reference(entry)) => {
                self.inverse.push(InverseOp::Unlink {
                    target_type: r.target_type_id,
                    target: entry.id,
                    prop: r.inverse_prop_id,
                    source: id,
                });
                None
            }
            _ => None,
        };
        let edge = self.edge_node(p, current, edges)?;
        node.fields.insert(
            p.prop,
            Field::Reference(RefEntry {
                id: target,
                edge: edge.clone(),
            }),
        );
        self.inverse.push(InverseOp::Link {
            target_type: r.target_type_id,
            target,
            prop: r.inverse_prop_id,
            source_type: def.id,
            source_prop: p.prop,
            source: id,
            edge,
        });
        self.changes.prop(def.id, p.prop);
        Ok(())
    }

    fn references(&mut self, def: &TypeDef, id: NodeId, node: &mut Node, p: &PropDef, ops: &[RefOp<'_>]) -> Result<()> {
        let r = p.reference.clone().ok_or_else(|| unresolved(def, p))?;
        let mut list = match node.fields.remove(&p.prop) {
            Some(Field::References(list)) => list,
            Some(Field::Reference(entry)) => vec![entry],
            _ => Vec::new(),
        };
        // Edges of cleared entries, reused when the same target comes back.
        let mut stash: HashMap<NodeId, Option<Box<Node>>> = HashMap::new();

        let unlink = |target: NodeId| InverseOp::Unlink {
            target_type: r.target_type_id,
            target,
            prop: r.inverse_prop_id,
            source: id,
        };
        let link = |target: NodeId, edge: Option<Box<Node>>| InverseOp::Link {
            target_type: r.target_type_id,
            target,
            prop: r.inverse_prop_id,
            source_type: def.id,
            source_prop: p.prop,
            source: id,
            edge,
        };

        for op in ops {
            match op {
                RefOp::Clear => {
                    for entry in list.drain(..) {
                        self.inverse.push(unlink(entry.id));
                        stash.insert(entry.id, entry.edge);
                    }
                }
                RefOp::Ids(ids) | RefOp::TmpIds(ids) => {
                    let is_tmp = matches!(op, RefOp::TmpIds(_));
                    for raw in ids {
                        let Some(target) = self.target(def, id, p, is_tmp, *raw)? else { continue };
                        if list.iter().any(|e| e.id == target) {
                            continue;
                        }
                        let edge = stash.remove(&target).flatten();
                        self.inverse.push(link(target, edge.clone()));
                        list.push(RefEntry { id: target, edge });
                    }
                }
                RefOp::WithMeta(items) => {
                    for EdgeItem {
                        id: raw,
                        is_tmp,
                        index,
                        edges,
                    } in items
                    {
                        let Some(target) = self.target(def, id, p, *is_tmp, *raw)? else { continue };
                        let pos = list.iter().position(|e| e.id == target);
                        let current = match pos {
                            Some(i) => list[i].edge.take(),
                            None => stash.remove(&target).flatten(),
                        };
                        let edge = self.edge_node(p, current, edges)?;
                        match (pos, index) {
                            (Some(i), Some(index)) => {
                                let mut entry = list.remove(i);
                                entry.edge = edge.clone();
                                list.insert((*index as usize).min(list.len()), entry);
                            }
                            (Some(i), None) => list[i].edge = edge.clone(),
                            (None, Some(index)) => list.insert(
                                (*index as usize).min(list.len()),
                                RefEntry {
                                    id: target,
                                    edge: edge.clone(),
                                },
                            ),
                            (None, None) => list.push(RefEntry {
                                id: target,
                                edge: edge.clone(),
                            }),
                        }
                        self.inverse.push(link(target, edge));
                    }
                }
                RefOp::Delete(ids) => {
                    let remove: BTreeSet<NodeId> = ids.iter().copied().collect();
                    list.retain(|e| {
                        if remove.contains(&e.id) {
                            self.inverse.push(unlink(e.id));
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }

        if !list.is_empty() {
            node.fields.insert(p.prop, Field::References(list));
        }
        self.changes.prop(def.id, p.prop);
        Ok(())
    }

    fn delete(&mut self, def: &TypeDef, id: NodeId) -> Result<()> {
        if !self.exists(def.id, id)? {
            debug!(type_name = %def.name, id, "delete of missing node skipped");
            return Ok(());
        }
        let Some(node) = self.db.store_mut(def.id)?.remove(id) else {
            return Ok(());
        };
        for p in def.reference_props() {
            let Some(r) = &p.reference else { continue };
            for target in node.ref_ids(p.prop) {
                self.inverse.push(InverseOp::Unlink {
                    target_type: r.target_type_id,
                    target,
                    prop: r.inverse_prop_id,
                    source: id,
                });
            }
        }
        for p in def.alias_props() {
            self.clear_alias(def, id, &node, p.prop)?;
        }
        self.db.mark_dirty(def.id, id)?;
        self.changes.structural.insert(def.id);
        self.flush_inverse()
    }

    fn flush_inverse(&mut self) -> Result<()> {
        for op in std::mem::take(&mut self.inverse) {
            self.apply_inverse(op)?;
        }
        Ok(())
    }

    fn apply_inverse(&mut self, op: InverseOp) -> Result<()> {
        let defs = self.defs.clone();
        match op {
            InverseOp::Unlink {
                target_type,
                target,
                prop,
                source,
            } => {
                self.db.ensure_loaded(target_type, target)?;
                let Some(node) = self.db.store_mut(target_type)?.get_mut(target) else {
                    return Ok(());
                };
                match node.fields.get_mut(&prop) {
                    Some(Field::Reference(entry)) if entry.id == source => {
                        node.fields.remove(&prop);
                    }
                    Some(Field::References(list)) => {
                        list.retain(|e| e.id != source);
                        if list.is_empty() {
                            node.fields.remove(&prop);
                        }
                    }
                    _ => return Ok(()),
                }
                self.db.mark_dirty(target_type, target)?;
                self.changes.prop(target_type, prop);
            }
            InverseOp::Link {
                target_type,
                target,
                prop,
                source_type,
                source_prop,
                source,
                edge,
            } => {
                let target_def = defs.require_id(target_type)?;
                let inverse = separate_prop(target_def, prop)?;
                self.db.ensure_loaded(target_type, target)?;
                let Some(node) = self.db.store_mut(target_type)?.get_mut(target) else {
                    return Ok(());
                };
                let mut displaced = None;
                if inverse.kind == PropKind::Reference {
                    if let Some(Field::Reference(old)) = node.fields.get(&prop) {
                        if old.id != source {
                            displaced = Some(old.id);
                        }
                    }
                    node.fields.insert(prop, Field::Reference(RefEntry { id: source, edge }));
                } else {
                    let entry = node.fields.entry(prop).or_insert_with(|| Field::References(Vec::new()));
                    if let Field::References(list) = entry {
                        match list.iter_mut().find(|e| e.id == source) {
                            Some(existing) => existing.edge = edge,
                            None => list.push(RefEntry { id: source, edge }),
                        }
                    }
                }
                self.db.mark_dirty(target_type, target)?;
                self.changes.prop(target_type, prop);

                // A single-valued inverse can point at one source only.
                if let Some(old_source) = displaced {
                    self.db.ensure_loaded(source_type, old_source)?;
                    if let Some(old) = self.db.store_mut(source_type)?.get_mut(old_source) {
                        match old.fields.get_mut(&source_prop) {
                            Some(Field::Reference(e)) if e.id == target => {
                                old.fields.remove(&source_prop);
                            }
                            Some(Field::References(list)) => {
                                list.retain(|e| e.id != target);
                                if list.is_empty() {
                                    old.fields.remove(&source_prop);
                                }
                            }
                            _ => {}
                        }
                        self.db.mark_dirty(source_type, old_source)?;
                        self.changes.prop(source_type, source_prop);
                    }
                }
            }
        }
        Ok(())
    }
}

fn separate_prop(def: &TypeDef, prop: u8) -> Result<&PropDef> {
    def.by_prop_id(prop)
        .filter(|p| p.separate)
        .ok_or_else(|| Error::malformed(WHAT, format!("{} has no separate prop {}", def.name, prop)))
}

fn unresolved(def: &TypeDef, p: &PropDef) -> Error {
    Error::InvalidReference {
        type_name: def.name.clone(),
        path: p.path.clone(),
        message: "unresolved reference".to_string(),
    }
}

/// Apply a block that only touches the node itself.
fn apply_value_block(def: &TypeDef, node: &mut Node, block: &Block<'_>) -> Result<()> {
    match block {
        Block::Main(data) => {
            if data.len() != def.main_len {
                return Err(Error::malformed(
                    WHAT,
                    format!("{} main is {} bytes, got {}", def.name, def.main_len, data.len()),
                ));
            }
            node.main = data.to_vec();
        }
        Block::PartialMain(slices) => {
            for (start, data) in slices {
                let start = *start as usize;
                let end = start + data.len();
                if end > node.main.len() {
                    return Err(Error::malformed(WHAT, format!("main slice {}..{} out of bounds", start, end)));
                }
                node.main[start..end].copy_from_slice(data);
            }
        }
        Block::Increment { start, kind, delta } => increment(&mut node.main, *start as usize, *kind, *delta)?,
        Block::Field { prop, data } => {
            separate_prop(def, *prop)?;
            node.fields.insert(*prop, Field::Bytes(data.to_vec()));
        }
        Block::Text { prop, locale, data } => {
            separate_prop(def, *prop)?;
            let entry = node.fields.entry(*prop).or_insert_with(|| Field::Text(BTreeMap::new()));
            match entry {
                Field::Text(locales) => {
                    locales.insert(locale.to_string(), data.to_vec());
                }
                other => *other = Field::Text(BTreeMap::from([(locale.to_string(), data.to_vec())])),
            }
        }
        Block::Cardinality { prop, hashes } => {
            separate_prop(def, *prop)?;
            let entry = node.fields.entry(*prop).or_insert_with(|| Field::Cardinality(BTreeSet::new()));
            match entry {
                Field::Cardinality(set) => set.extend(hashes.iter().copied()),
                other => *other = Field::Cardinality(hashes.iter().copied().collect()),
            }
        }
        Block::DeleteField { prop } => {
            node.fields.remove(prop);
        }
        Block::Reference { .. } | Block::References { .. } => {
            return Err(Error::malformed(WHAT, format!("{} cannot hold references", def.name)));
        }
    }
    Ok(())
}

/// Add `delta` to a numeric main field. `delta` is rounded for integer
/// fields, and integers wrap around in the field's own width.
fn increment(main: &mut [u8], start: usize, kind: PropKind, delta: f64) -> Result<()> {
    let size = kind.main_size();
    if size == 0 || !kind.is_numeric() || start + size > main.len() {
        return Err(Error::malformed(WHAT, format!("cannot increment {} at {}", kind, start)));
    }
    if kind == PropKind::Number {
        write_f64(main, start, read_f64(main, start) + delta);
        return Ok(());
    }
    let step = delta.round() as i64;
    match kind {
        PropKind::Int8 => write_i8(main, start, read_i8(main, start).wrapping_add(step as i8)),
        PropKind::Uint8 => write_u8(main, start, read_u8(main, start).wrapping_add(step as u8)),
        PropKind::Int16 => write_i16(main, start, read_i16(main, start).wrapping_add(step as i16)),
        PropKind::Uint16 => write_u16(main, start, read_u16(main, start).wrapping_add(step as u16)),
        PropKind::Int32 => write_i32(main, start, read_i32(main, start).wrapping_add(step as i32)),
        PropKind::Uint32 => write_u32(main, start, read_u32(main, start).wrapping_add(step as u32)),
        PropKind::Timestamp => write_i64(main, start, read_i64(main, start).wrapping_add(step)),
        _ => return Err(Error::malformed(WHAT, format!("cannot increment {}", kind))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_wraps_in_field_width() {
        let mut main = vec![0u8; 8];
        increment(&mut main, 0, PropKind::Uint8, 300.0).unwrap();
        assert_eq!(read_u8(&main, 0), 44);
        increment(&mut main, 0, PropKind::Uint8, -300.0).unwrap();
        assert_eq!(read_u8(&main, 0), 0);
        increment(&mut main, 0, PropKind::Uint8, -1.0).unwrap();
        assert_eq!(read_u8(&main, 0), 255);
        increment(&mut main, 0, PropKind::Uint8, 1.0).unwrap();
        assert_eq!(read_u8(&main, 0), 0);

        write_i32(&mut main, 0, i32::MAX);
        increment(&mut main, 0, PropKind::Int32, 1.0).unwrap();
        assert_eq!(read_i32(&main, 0), i32::MIN);
        increment(&mut main, 0, PropKind::Int32, -1.0).unwrap();
        assert_eq!(read_i32(&main, 0), i32::MAX);

        write_u32(&mut main, 0, 0);
        increment(&mut main, 0, PropKind::Uint32, -2.0).unwrap();
        assert_eq!(read_u32(&main, 0), u32::MAX - 1);

        write_i16(&mut main, 0, -2);
        increment(&mut main, 0, PropKind::Int16, 2.4).unwrap();
        assert_eq!(read_i16(&main, 0), 0);
    }

    #[test]
    fn test_increment_number_and_bounds() {
        let mut main = vec![0u8; 8];
        increment(&mut main, 0, PropKind::Number, 1.5).unwrap();
        assert_eq!(read_f64(&main, 0), 1.5);
        assert!(increment(&mut main, 4, PropKind::Number, 1.0).is_err());
        assert!(increment(&mut main, 0, PropKind::String, 1.0).is_err());
    }
}
