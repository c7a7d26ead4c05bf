//! Node records of a nodes result: selected main bytes, separate fields,
//! string metadata and nested references with their edge properties.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use basedb_core::schema::default_main;
use basedb_core::string::StringCodec;
use basedb_core::{NodeId, PropKind, Result, TypeDef};
use basedb_protocol::query::{EdgeSelect, MainSelect, QueryPlan, RefPlan};
use basedb_protocol::response::{
    put_block, put_field, put_main, put_meta, put_node_end, put_node_start, put_text, EDGE, MAIN, REF, REFS,
};

use super::{window, Executor, Hit};
use crate::store::{Field, Node, RefEntry};

impl Executor<'_> {
    /// Blocks and END of a node whose NODE header is already written.
    pub(crate) fn write_body(&self, buf: &mut BytesMut, def: &TypeDef, node: &Node, plan: &QueryPlan) -> Result<()> {
        self.write_fields(buf, node, &plan.main, &plan.fields)?;
        for prop in &plan.meta {
            let data = match node.fields.get(prop) {
                Some(Field::Bytes(data)) => Some(data),
                Some(Field::Text(locales)) => match self.locale {
                    Some(l) => locales.get(l),
                    None => locales.values().next(),
                },
                _ => None,
            };
            if let Some(data) = data {
                put_meta(buf, *prop, &StringCodec::meta(data)?);
            }
        }
        for rp in &plan.refs {
            self.write_ref(buf, def, node, rp)?;
        }
        put_node_end(buf);
        Ok(())
    }

    fn write_fields(&self, buf: &mut BytesMut, node: &Node, main: &MainSelect, fields: &[u8]) -> Result<()> {
        match main {
            MainSelect::None => {}
            MainSelect::All => put_main(buf, &node.main),
            MainSelect::Slices(slices) => put_block(buf, MAIN, |b| {
                for (start, len) in slices {
                    let (start, end) = (*start as usize, *start as usize + *len as usize);
                    match node.main.get(start..end) {
                        Some(bytes) => b.put_slice(bytes),
                        None => b.put_bytes(0, end - start),
                    }
                }
            }),
        }
        for prop in fields {
            match node.fields.get(prop) {
                Some(Field::Bytes(data)) => put_field(buf, *prop, data),
                Some(Field::Text(locales)) => {
                    for (locale, data) in locales {
                        if self.locale.map_or(true, |l| l == locale) {
                            put_text(buf, *prop, locale, data);
                        }
                    }
                }
                Some(Field::Cardinality(set)) => put_field(buf, *prop, &(set.len() as u32).to_le_bytes()),
                _ => {}
            }
        }
        Ok(())
    }

    fn write_ref(&self, buf: &mut BytesMut, def: &TypeDef, node: &Node, rp: &RefPlan) -> Result<()> {
        let Some(target_type) = def
            .by_prop_id(rp.prop)
            .and_then(|p| p.reference.as_ref())
            .map(|r| r.target_type_id)
        else {
            return Ok(());
        };
        let target_def = self.db.defs.require_id(target_type)?;
        let store = self.db.store(target_type)?;

        let entries: Vec<&RefEntry> = match node.fields.get(&rp.prop) {
            Some(Field::Reference(entry)) => vec![entry],
            Some(Field::References(list)) => list.iter().collect(),
            _ => Vec::new(),
        };
        let mut selected: Vec<(Hit<'_>, &RefEntry)> = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(target) = store.get(entry.id) else { continue };
            if let Some(filter) = &rp.plan.filter {
                if !self.matches(target_def, entry.id, target, filter)? {
                    continue;
                }
            }
            selected.push(((entry.id, target), entry));
        }

        if def.by_prop_id(rp.prop).is_some_and(|p| p.kind == PropKind::Reference) {
            let mut out = Ok(());
            put_block(buf, REF, |b| {
                b.put_u8(rp.prop);
                if let Some(((id, target), entry)) = selected.first() {
                    out = self.write_record(b, target_def, *id, target, entry, rp);
                }
            });
            return out;
        }

        if let Some(sort) = &rp.plan.sort {
            let mut hits: Vec<Hit<'_>> = selected.iter().map(|(hit, _)| *hit).collect();
            self.sort(target_def, &mut hits, sort)?;
            let order: HashMap<NodeId, usize> = hits.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();
            selected.sort_by_key(|((id, _), _)| order.get(id).copied().unwrap_or(usize::MAX));
        }
        let selected = window(selected, rp.plan.range);

        let mut out = Ok(());
        put_block(buf, REFS, |b| {
            b.put_u8(rp.prop);
            b.put_u32_le(selected.len() as u32);
            for ((id, target), entry) in &selected {
                out = self.write_record(b, target_def, *id, target, entry, rp);
                if out.is_err() {
                    break;
                }
            }
        });
        out
    }

    fn write_record(
        &self,
        buf: &mut BytesMut,
        def: &TypeDef,
        id: NodeId,
        node: &Node,
        entry: &RefEntry,
        rp: &RefPlan,
    ) -> Result<()> {
        put_node_start(buf, id);
        if let Some(edge) = &rp.edge {
            self.write_edge(buf, edge, entry)?;
        }
        self.write_body(buf, def, node, &rp.plan)
    }

    /// Edge properties travel in one EDGE block inside the target record.
    fn write_edge(&self, buf: &mut BytesMut, edge: &EdgeSelect, entry: &RefEntry) -> Result<()> {
        let default;
        let edge_node = match &entry.edge {
            Some(node) => node.as_ref(),
            None => {
                default = Node::new(default_main(self.db.defs.require_id(edge.type_id)?));
                &default
            }
        };
        let mut inner = BytesMut::new();
        self.write_fields(&mut inner, edge_node, &edge.main, &edge.fields)?;
        put_block(buf, EDGE, |b| b.put_slice(&inner));
        Ok(())
    }
}
