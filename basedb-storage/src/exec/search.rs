//! Lexical and vector search.
//!
//! Lexical: each query token that prefixes a token of a searched field adds
//! that field's weight to the node's score. Vector: nodes within the
//! threshold of the query vector, closest first.

use std::cmp::Ordering;

use basedb_core::string::search_tokens;
use basedb_core::{NodeId, Result, TypeDef, Value};
use basedb_protocol::query::{FieldRef, SearchPlan};

use super::{Executor, Hit};
use crate::distance::{measure, score, within};
use crate::store::Node;

impl<'a> Executor<'a> {
    pub(crate) fn search(&self, def: &TypeDef, hits: Vec<Hit<'a>>, search: &SearchPlan) -> Result<Vec<Hit<'a>>> {
        let mut scored = Vec::with_capacity(hits.len());
        match search {
            SearchPlan::Lexical { tokens, fields } => {
                if tokens.is_empty() {
                    return Ok(hits);
                }
                for (id, node) in hits {
                    let mut total = 0.0;
                    for (field, weight) in fields {
                        let content = self.field_tokens(def, id, node, field)?;
                        let found = tokens
                            .iter()
                            .filter(|t| content.iter().any(|c| c.starts_with(t.as_str())))
                            .count();
                        total += (found * *weight as usize) as f64;
                    }
                    if total > 0.0 {
                        scored.push((total, (id, node)));
                    }
                }
            }
            SearchPlan::Vector {
                field,
                vector,
                distance,
                threshold,
            } => {
                for (id, node) in hits {
                    let Some(Value::Vector(stored)) = self.field_value(def, id, node, field)? else {
                        continue;
                    };
                    if stored.len() != vector.len() {
                        continue;
                    }
                    let value = measure(*distance, &stored, vector);
                    if within(*distance, value, *threshold) {
                        scored.push((score(*distance, value), (id, node)));
                    }
                }
            }
        }
        scored.sort_by(|(a, ha), (b, hb)| b.partial_cmp(a).unwrap_or(Ordering::Equal).then(ha.0.cmp(&hb.0)));
        Ok(scored.into_iter().map(|(_, hit)| hit).collect())
    }

    fn field_tokens(&self, def: &TypeDef, id: NodeId, node: &Node, field: &FieldRef) -> Result<Vec<String>> {
        Ok(match self.field_value(def, id, node, field)? {
            Some(Value::String(s)) => search_tokens(&s),
            Some(Value::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .flat_map(search_tokens)
                .collect(),
            _ => Vec::new(),
        })
    }
}
