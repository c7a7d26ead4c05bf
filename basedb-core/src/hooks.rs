//! # Hooks
//!
//! The boundary between a client and a backend. Everything crossing it is a
//! schema or a raw byte buffer, so a backend may live in-process, behind a
//! socket or in a test double.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::error::Result;
use crate::schema::Schema;

/// Outcome of a modify flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Per dirty type, the delta the backend added to client-local ids.
    /// `None` means the batch was built against a stale schema and was
    /// discarded.
    pub offsets: Option<BTreeMap<u16, u32>>,
    /// Milliseconds the backend spent applying the batch.
    pub db_write_time: Option<u64>,
}

impl FlushResult {
    pub fn schema_mismatch() -> Self {
        Self::default()
    }
}

/// Notification sent after every applied batch: the types and separate
/// prop ids / main slices it touched, used to re-run live queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// type id → touched separate prop ids
    pub props: BTreeMap<u16, Vec<u8>>,
    /// type id → touched `(start, len)` main slices
    pub main: BTreeMap<u16, Vec<(u16, u16)>>,
    /// Types with created or deleted nodes.
    pub structural: Vec<u16>,
}

#[async_trait]
pub trait Hooks: Send + Sync {
    /// Install or migrate to `schema`; returns the hash of the active schema.
    async fn set_schema(&self, schema: Schema) -> Result<u64>;

    /// Apply a modify batch.
    async fn flush_modify(&self, buf: Bytes) -> Result<FlushResult>;

    /// Execute a query batch and return the raw response.
    async fn get_query_buf(&self, buf: Bytes) -> Result<Bytes>;

    /// Receiver of the active schema; updated on every `set_schema`.
    fn subscribe_schema(&self) -> watch::Receiver<Schema>;

    /// Receiver of per-batch change notifications.
    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeSet>;
}
