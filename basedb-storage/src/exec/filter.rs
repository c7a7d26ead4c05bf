//! Filter evaluation against stored nodes.
//!
//! Values are compared in the domain the query planner normalized them to:
//! strings in NFKD form, timestamps as epoch milliseconds, enums by member
//! name and references as lists of ids.

use std::cmp::Ordering;

use basedb_core::schema::decode_main;
use basedb_core::{NodeId, PropKind, Result, TypeDef, Value};
use basedb_protocol::query::{FieldRef, FilterPlan, GroupEntry, Operator};

use super::Executor;
use crate::store::{Field, Node};

impl Executor<'_> {
    /// Current value of `field` on a node; `None` when a separate field is
    /// not set.
    pub(crate) fn field_value(&self, def: &TypeDef, id: NodeId, node: &Node, field: &FieldRef) -> Result<Option<Value>> {
        if field.is_id() {
            return Ok(Some(Value::Int(id as i64)));
        }
        if field.is_main() {
            let prop = def
                .main_props()
                .find(|p| p.start == field.start as usize && p.len == field.len as usize);
            return match prop {
                Some(p) => decode_main(p, &node.main).map(Some),
                None => Ok(None),
            };
        }
        let Some(p) = def.by_prop_id(field.prop) else {
            return Ok(None);
        };
        let Some(stored) = node.fields.get(&field.prop) else {
            return Ok(None);
        };
        let codec = &self.db.codec;
        Ok(Some(match (p.kind, stored) {
            (PropKind::String | PropKind::Alias | PropKind::Json, Field::Bytes(data)) => Value::String(codec.decode(data)?),
            (PropKind::Vector, Field::Bytes(data)) => Value::Vector(
                data.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            (_, Field::Bytes(data)) => Value::Binary(data.clone()),
            (_, Field::Text(locales)) => {
                let mut out = Vec::with_capacity(locales.len());
                for (locale, data) in locales {
                    if self.locale.map_or(true, |l| l == locale) {
                        out.push(Value::String(codec.decode(data)?));
                    }
                }
                Value::List(out)
            }
            (_, Field::Cardinality(set)) => Value::Int(set.len() as i64),
            (_, Field::Reference(_) | Field::References(_)) => {
                Value::List(node.ref_ids(field.prop).into_iter().map(|id| Value::Int(id as i64)).collect())
            }
        }))
    }

    pub(crate) fn matches(&self, def: &TypeDef, id: NodeId, node: &Node, filter: &FilterPlan) -> Result<bool> {
        Ok(match filter {
            FilterPlan::And(a, b) => self.matches(def, id, node, a)? && self.matches(def, id, node, b)?,
            FilterPlan::Or(a, b) => self.matches(def, id, node, a)? || self.matches(def, id, node, b)?,
            FilterPlan::Group(group) => {
                for entry in &group.entries {
                    if !self.entry_matches(def, id, node, entry)? {
                        return Ok(false);
                    }
                }
                true
            }
        })
    }

    fn entry_matches(&self, def: &TypeDef, id: NodeId, node: &Node, entry: &GroupEntry) -> Result<bool> {
        match entry {
            GroupEntry::Field { field, conds } => {
                let actual = self.field_value(def, id, node, field)?;
                let actual = match actual {
                    Some(v) => Some(v),
                    None => def.by_prop_id(field.prop).map(|p| match p.kind {
                        PropKind::Text | PropKind::Reference | PropKind::References => Value::List(Vec::new()),
                        _ => p.empty_value(),
                    }),
                };
                let present = node_has(node, field);
                Ok(conds
                    .iter()
                    .any(|(op, expected)| condition(actual.as_ref(), present, *op, expected)))
            }
            GroupEntry::Ref { prop, filter } => {
                let Some(target_type) = def.by_prop_id(*prop).and_then(|p| p.reference.as_ref()).map(|r| r.target_type_id)
                else {
                    return Ok(false);
                };
                let target_def = self.db.defs.require_id(target_type)?;
                let Some(store) = self.db.types.get(&target_type) else {
                    return Ok(false);
                };
                for target in node.ref_ids(*prop) {
                    if let Some(target_node) = store.get(target) {
                        if self.matches(target_def, target, target_node, filter)? {
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
        }
    }
}

fn node_has(node: &Node, field: &FieldRef) -> bool {
    if field.is_id() || field.is_main() {
        return true;
    }
    match node.fields.get(&field.prop) {
        None => false,
        Some(Field::References(list)) => !list.is_empty(),
        Some(Field::Text(locales)) => !locales.is_empty(),
        Some(_) => true,
    }
}

fn condition(actual: Option<&Value>, present: bool, op: Operator, expected: &Value) -> bool {
    match op {
        Operator::Exists => return present,
        Operator::NotExists => return !present,
        _ => {}
    }
    let Some(actual) = actual else {
        return op == Operator::NotEq;
    };
    // Multi-valued fields match when any of their values does; != when none does.
    if let Value::List(items) = actual {
        return match op {
            Operator::NotEq => !items.iter().any(|a| scalar(a, Operator::Eq, expected)),
            _ => items.iter().any(|a| scalar(a, op, expected)),
        };
    }
    match op {
        Operator::NotEq => !scalar(actual, Operator::Eq, expected),
        _ => scalar(actual, op, expected),
    }
}

fn scalar(actual: &Value, op: Operator, expected: &Value) -> bool {
    if op == Operator::Range {
        let Some([low, high]) = expected.as_list().and_then(|l| <&[Value; 2]>::try_from(l).ok()) else {
            return false;
        };
        return matches!(compare(actual, low), Some(Ordering::Greater | Ordering::Equal))
            && matches!(compare(actual, high), Some(Ordering::Less | Ordering::Equal));
    }
    // A list of expected values means any of them.
    if let Value::List(options) = expected {
        return options.iter().any(|e| scalar(actual, op, e));
    }
    match op {
        Operator::Eq => compare(actual, expected) == Some(Ordering::Equal),
        Operator::Has => match (actual, expected) {
            (Value::String(a), Value::String(e)) => a.to_lowercase().contains(&e.to_lowercase()),
            _ => compare(actual, expected) == Some(Ordering::Equal),
        },
        Operator::Gt => compare(actual, expected) == Some(Ordering::Greater),
        Operator::Lt => compare(actual, expected) == Some(Ordering::Less),
        Operator::Ge => matches!(compare(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Le => matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        Operator::NotEq => compare(actual, expected) != Some(Ordering::Equal),
        Operator::Range | Operator::Exists | Operator::NotExists => false,
    }
}

/// Order of two scalar values; `None` when they are not comparable.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Binary(x), Value::Binary(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Int(y)) | (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Timestamp(y)) | (Value::Timestamp(x), Value::Int(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}
