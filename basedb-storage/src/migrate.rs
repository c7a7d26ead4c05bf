//! Schema migration of stored nodes.
//!
//! When `set_schema` changes the layout of an existing type, every node of
//! that type is rewritten: main fields are carried over by path (falling back
//! to the new default when the old value no longer fits), separate fields are
//! remapped to their new prop ids, and edge nodes follow their relation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use basedb_core::block::block_key;
use basedb_core::schema::{decode_main, default_main, encode_main};
use basedb_core::{Error, PropDef, PropKind, Result, TypeDef, TypeDefs};

use crate::csmt::Csmt;
use crate::db::Db;
use crate::dump::DumpInfo;
use crate::store::{Field, Node};

/// What a migration touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateReport {
    /// Types whose nodes were rewritten.
    pub changed: Vec<u16>,
    /// Dumps of types that no longer exist.
    pub removed: Vec<DumpInfo>,
}

#[derive(Debug, PartialEq)]
struct PropSig<'a> {
    path: &'a str,
    kind: PropKind,
    prop: u8,
    start: usize,
    len: usize,
    enum_values: &'a [String],
    edge: Option<Vec<PropSig<'a>>>,
}

fn signature<'a>(defs: &'a TypeDefs, def: &'a TypeDef) -> (usize, Vec<PropSig<'a>>) {
    let props = def
        .props
        .iter()
        .map(|p| PropSig {
            path: &p.path,
            kind: p.kind,
            prop: p.prop,
            start: p.start,
            len: p.len,
            enum_values: &p.enum_values,
            edge: defs.edge_def(p).map(|e| signature(defs, e).1),
        })
        .collect();
    (def.main_len, props)
}

fn compatible(old: &PropDef, new: &PropDef) -> bool {
    old.kind == new.kind || (old.kind.is_numeric() && new.kind.is_numeric())
}

impl Db {
    /// Switch to `defs`, rewriting the nodes of every type whose layout
    /// changed.
    pub fn migrate(&mut self, defs: Arc<TypeDefs>) -> Result<MigrateReport> {
        let old = self.defs.clone();
        let mut report = MigrateReport::default();

        for new_def in defs.types() {
            let Some(old_def) = old.by_id(new_def.id) else { continue };
            if old_def.block_capacity != new_def.block_capacity {
                return Err(Error::Configuration {
                    message: format!(
                        "block capacity of {} cannot change from {} to {}",
                        new_def.name, old_def.block_capacity, new_def.block_capacity
                    ),
                });
            }
            if signature(&old, old_def) != signature(&defs, new_def) {
                report.changed.push(new_def.id);
            }
        }

        for type_id in &report.changed {
            for (start, state) in self.blocks.blocks_of(*type_id)? {
                if !state.inmem {
                    self.load_block(*type_id, start)?;
                }
            }
        }

        for old_def in old.types() {
            if defs.by_id(old_def.id).is_none() {
                for (start, _) in self.blocks.blocks_of(old_def.id)? {
                    report.removed.push(DumpInfo {
                        type_id: old_def.id,
                        start,
                        end: basedb_core::block::block_end(start, old_def.block_capacity),
                    });
                }
                info!(type_name = %old_def.name, "type removed from schema");
            }
        }

        for type_id in &report.changed {
            let (Some(old_def), Some(new_def)) = (old.by_id(*type_id), defs.by_id(*type_id)) else { continue };
            let codec = self.codec.clone();
            let store = self.store_mut(*type_id)?;
            store.reset_aliases();
            let starts: Vec<u32> = store.block_starts().collect();
            let mut count = 0;
            for start in &starts {
                let nodes = store.take_block(*start).unwrap_or_default();
                let nodes: BTreeMap<_, _> = nodes
                    .into_iter()
                    .map(|(id, node)| (id, migrate_node(&old, old_def, &defs, new_def, node)))
                    .collect();
                count += nodes.len();
                store.index_aliases(new_def, &codec, &nodes, true);
                store.put_block(*start, nodes);
            }
            for start in starts {
                self.blocks.mark_dirty(block_key(*type_id, start))?;
            }
            debug!(type_name = %new_def.name, nodes = count, "migrated nodes");
        }

        self.defs = defs;
        self.sync_stores();
        if !report.removed.is_empty() {
            self.tree = Csmt::from_leaves(self.blocks.iter().map(|(k, s)| (k, s.hash)))?;
        }
        if !report.changed.is_empty() {
            warn!(types = ?report.changed, "schema change rewrote stored nodes");
        }
        Ok(report)
    }
}

fn migrate_node(old_defs: &TypeDefs, old: &TypeDef, new_defs: &TypeDefs, new: &TypeDef, node: Node) -> Node {
    let mut main = default_main(new);
    for p in new.main_props() {
        let Some(old_p) = old.prop(&p.path).filter(|o| !o.separate && compatible(o, p)) else {
            continue;
        };
        if let Ok(value) = decode_main(old_p, &node.main) {
            if !value.is_null() {
                let mut slot = main.clone();
                // Values the new layout rejects keep the default.
                if encode_main(p, &value, &mut slot).is_ok() {
                    main = slot;
                }
            }
        }
    }

    let mut out = Node::new(main);
    for (prop, field) in node.fields {
        let Some(old_p) = old.by_prop_id(prop) else { continue };
        let Some(new_p) = new.prop(&old_p.path).filter(|n| n.separate && n.kind == old_p.kind) else {
            continue;
        };
        let field = match (old_defs.edge_def(old_p), new_defs.edge_def(new_p)) {
            (Some(old_edge), Some(new_edge)) => migrate_edges(old_defs, old_edge, new_defs, new_edge, field),
            (Some(_), None) => strip_edges(field),
            _ => field,
        };
        out.fields.insert(new_p.prop, field);
    }
    out
}

fn migrate_edges(old_defs: &TypeDefs, old: &TypeDef, new_defs: &TypeDefs, new: &TypeDef, field: Field) -> Field {
    let edge = |e: Option<Box<Node>>| e.map(|n| Box::new(migrate_node(old_defs, old, new_defs, new, *n)));
    match field {
        Field::Reference(mut entry) => {
            entry.edge = edge(entry.edge);
            Field::Reference(entry)
        }
        Field::References(list) => Field::References(
            list.into_iter()
                .map(|mut entry| {
                    entry.edge = edge(entry.edge);
                    entry
                })
                .collect(),
        ),
        other => other,
    }
}

fn strip_edges(field: Field) -> Field {
    match field {
        Field::Reference(mut entry) => {
            entry.edge = None;
            Field::Reference(entry)
        }
        Field::References(list) => Field::References(
            list.into_iter()
                .map(|mut entry| {
                    entry.edge = None;
                    entry
                })
                .collect(),
        ),
        other => other,
    }
}
