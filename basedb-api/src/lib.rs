//! # BasedDB API
//!
//! Client side of BasedDB: batched modifies, queries and live queries.
//!
//! ## Embedded vs Hooks
//!
//! ```ignore
//! // Embedded - opens the database directory in-process
//! let db = BasedDb::open("./data").await?;
//! db.set_schema(schema).await?;
//! let id = db.create("user", Payload::new().set("name", "youri")).await?;
//!
//! // Any backend - talks through the hooks boundary
//! let client = DbClient::new(Arc::new(server))?;
//! ```

pub mod client;
pub mod db;
pub mod subscription;

pub use client::{DbClient, PendingId};
pub use db::BasedDb;
pub use subscription::Subscription;

pub use basedb_protocol::{Operator, Order, Payload, Query, QueryResult, RefItem};
