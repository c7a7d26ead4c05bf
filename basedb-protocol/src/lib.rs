//! # BasedDB Protocol
//!
//! The byte-code spoken across [`Hooks`](basedb_core::Hooks):
//!
//! ```text
//!  client                                   backend
//!  ──────                                   ───────
//!  Payload ─serialize_*─> modify batch ───> parse_batch ─> apply
//!  Query ─compile_query─> QueryPlan
//!           encode_batch ─> query batch ──> decode_batch ─> execute
//!  ResultReader <──────── response ◀────── ResponseWriter
//! ```

pub mod modify;
pub mod query;
pub mod reader;
pub mod response;

pub use modify::{ModifyCtx, Payload, RefItem, TmpId};
pub use query::{compile_query, CompiledQuery, Operator, Order, Query, QueryDef, QueryPlan};
pub use reader::{QueryResult, ReaderSchema, ResultReader};
