//! # Query execution
//!
//! Runs decoded query plans against the loaded nodes and writes the binary
//! response the client's result reader decodes.
//!
//! ```text
//! target ─► filter ─► search ─► sort ─► range ─► include ─► response
//!                                  └──────────► aggregate ─┘
//! ```
//!
//! Only nodes of loaded blocks are visible; offloaded blocks are not
//! brought back in by a query.

mod aggregate;
mod filter;
mod include;
mod search;
mod sort;

use bytes::Bytes;
use tracing::debug;

use basedb_core::{Error, NodeId, Result, TypeDef};
use basedb_protocol::query::{decode_batch, PlanTarget, QueryPlan};
use basedb_protocol::response::{NodesWriter, ResponseWriter};

use crate::db::Db;
use crate::store::Node;

pub(crate) use filter::compare;

/// Read-only view over the database for one query.
pub(crate) struct Executor<'a> {
    pub(crate) db: &'a Db,
    pub(crate) locale: Option<&'a str>,
}

/// A selected node.
pub(crate) type Hit<'a> = (NodeId, &'a Node);

impl Db {
    /// Execute a batch of encoded query plans; returns the response buffer.
    pub fn execute_batch(&self, buf: &[u8]) -> Result<Bytes> {
        let plans = decode_batch(buf)?;
        let mut out = ResponseWriter::new();
        for (query_id, plan) in &plans {
            let result = self.execute(plan).inspect_err(|e| {
                self.metrics.record_query_error();
                debug!(query_id, error = %e, "query failed");
            })?;
            out.push(&result);
        }
        self.metrics.record_queries(plans.len() as u64);
        Ok(out.finish())
    }

    /// Execute one plan; returns a single result of the response.
    pub fn execute(&self, plan: &QueryPlan) -> Result<Bytes> {
        if plan.schema_hash != self.defs.hash {
            return Err(Error::InvalidQuery {
                message: format!(
                    "query compiled for schema {:016x}, current schema is {:016x}",
                    plan.schema_hash, self.defs.hash
                ),
            });
        }
        let def = self.defs.require_id(plan.type_id)?;
        let exec = Executor {
            db: self,
            locale: plan.locale.as_deref(),
        };

        if let Some(agg) = &plan.agg {
            if agg.root_count_only && plan.filter.is_none() && matches!(plan.target, PlanTarget::All) {
                return Ok(aggregate::count_only(self.store(def.id)?.len()));
            }
            let hits = exec.select(def, plan)?;
            return exec.aggregate(def, &hits, agg);
        }

        let hits = exec.select(def, plan)?;
        let hits = window(hits, plan.range);
        let mut writer = NodesWriter::new();
        for (id, node) in hits {
            let buf = writer.node(id);
            exec.write_body(buf, def, node, plan)?;
        }
        Ok(writer.finish())
    }
}

impl<'a> Executor<'a> {
    /// Target, filter, search and sort of a plan.
    fn select(&self, def: &TypeDef, plan: &QueryPlan) -> Result<Vec<Hit<'a>>> {
        let store = self.db.store(def.id)?;
        let mut hits: Vec<Hit<'a>> = match &plan.target {
            PlanTarget::All => store.iter().collect(),
            PlanTarget::Id(id) => store.get(*id).map(|n| (*id, n)).into_iter().collect(),
            PlanTarget::Ids(ids) => {
                let mut seen = std::collections::HashSet::with_capacity(ids.len());
                ids.iter()
                    .filter(|id| seen.insert(**id))
                    .filter_map(|id| store.get(*id).map(|n| (*id, n)))
                    .collect()
            }
            PlanTarget::Alias { prop, value } => store
                .alias(*prop, value)
                .and_then(|id| store.get(id).map(|n| (id, n)))
                .into_iter()
                .collect(),
        };

        if let Some(filter) = &plan.filter {
            let mut kept = Vec::with_capacity(hits.len());
            for hit in hits {
                if self.matches(def, hit.0, hit.1, filter)? {
                    kept.push(hit);
                }
            }
            hits = kept;
        }

        // Search results come ranked; an explicit sort overrides the ranking.
        if let Some(search) = &plan.search {
            hits = self.search(def, hits, search)?;
        }
        if let Some(sort) = &plan.sort {
            self.sort(def, &mut hits, sort)?;
        }
        Ok(hits)
    }
}

/// Apply an `(offset, limit)` window.
pub(crate) fn window<T>(items: Vec<T>, range: Option<(u32, u32)>) -> Vec<T> {
    match range {
        Some((offset, limit)) => items.into_iter().skip(offset as usize).take(limit as usize).collect(),
        None => items,
    }
}
