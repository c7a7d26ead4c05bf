//! Live queries.

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use basedb_core::{ChangeSet, Result};
use basedb_protocol::query::SubHeader;
use basedb_protocol::{Query, QueryResult};

use crate::client::DbClient;

/// Stream of results of one query. The first call to [`next`](Self::next)
/// returns the current result; later calls wait for a batch that touches
/// the types, fields or main slices the query reads.
pub struct Subscription {
    client: DbClient,
    query: Query,
    changes: broadcast::Receiver<ChangeSet>,
    header: Option<SubHeader>,
}

impl Subscription {
    pub(crate) fn new(client: DbClient, query: Query, changes: broadcast::Receiver<ChangeSet>) -> Self {
        Self {
            client,
            query,
            changes,
            header: None,
        }
    }

    /// `None` once the backend is gone.
    pub async fn next(&mut self) -> Option<Result<QueryResult>> {
        let Some(header) = &self.header else {
            return Some(self.run().await);
        };
        loop {
            match self.changes.recv().await {
                Ok(changes) if header.intersects(&changes) => break,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "subscription lagged, re-running");
                    break;
                }
                Err(RecvError::Closed) => return None,
            }
        }
        Some(self.run().await)
    }

    async fn run(&mut self) -> Result<QueryResult> {
        let (result, header) = self.client.query_with_header(&self.query).await?;
        self.header = Some(header);
        Ok(result)
    }
}
