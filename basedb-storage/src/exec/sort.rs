use std::cmp::Ordering;

use basedb_core::{Result, TypeDef, Value};
use basedb_protocol::query::SortPlan;

use super::{compare, Executor, Hit};

impl<'a> Executor<'a> {
    /// Stable sort on one field. Missing values sort first; equal keys keep
    /// id order.
    pub(crate) fn sort(&self, def: &TypeDef, hits: &mut Vec<Hit<'a>>, sort: &SortPlan) -> Result<()> {
        let mut keyed = Vec::with_capacity(hits.len());
        for (id, node) in hits.drain(..) {
            let key = self.field_value(def, id, node, &sort.field)?.map(sort_key);
            keyed.push((key, (id, node)));
        }
        keyed.sort_by(|(a, ha), (b, hb)| {
            let ord = order(a.as_ref(), b.as_ref());
            let ord = if sort.desc { ord.reverse() } else { ord };
            ord.then(ha.0.cmp(&hb.0))
        });
        hits.extend(keyed.into_iter().map(|(_, hit)| hit));
        Ok(())
    }
}

/// Multi-valued fields sort by their first value.
fn sort_key(value: Value) -> Value {
    match value {
        Value::List(mut items) if !items.is_empty() => items.swap_remove(0),
        Value::List(_) => Value::Null,
        other => other,
    }
}

fn order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare(a, b).unwrap_or(Ordering::Equal),
    }
}
