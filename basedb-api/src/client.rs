//! # BasedDB Client
//!
//! Owns the modify batch of one session and reaches the backend only
//! through [`Hooks`], so the same client drives an in-process server or
//! anything else that implements the trait.
//!
//! ```text
//! create/update/delete ──> ModifyCtx ──(flush_delay | max_modify_size)──> flush_modify
//!                                                                            │
//!            PendingId::resolve <──────────── offsets ───────────────────────┘
//!
//! query ──> compile_query ──> encode_batch ──> get_query_buf ──> ResultReader
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, warn};

use basedb_core::config::{ClientConfig, SchemaConfig};
use basedb_core::string::StringCodec;
use basedb_core::{compile, Config, Error, FlushResult, Hooks, NodeId, Result, Schema, TypeDefs, Value};
use basedb_protocol::modify::{
    serialize_create, serialize_delete, serialize_insert, serialize_update, serialize_upsert, Input, ModifyCtx, TmpId,
};
use basedb_protocol::query::{encode_batch, SubHeader};
use basedb_protocol::{compile_query, Payload, Query, QueryResult, ResultReader};

use crate::subscription::Subscription;

/// What happened to a flushed batch.
#[derive(Debug, Clone)]
enum BatchOutcome {
    /// Per-type offsets to add to client-local ids.
    Applied(BTreeMap<u16, u32>),
    /// Built against a stale schema and discarded by the backend.
    Stale,
    Failed(String),
}

type OutcomeRx = watch::Receiver<Option<BatchOutcome>>;

struct Batch {
    ctx: ModifyCtx,
    done: watch::Sender<Option<BatchOutcome>>,
}

struct State {
    defs: Arc<TypeDefs>,
    schema_rx: watch::Receiver<Schema>,
    /// Last ids the backend confirmed. New batches number their creates
    /// from here; the backend shifts them past whatever it holds.
    last_ids: BTreeMap<u16, u32>,
    next_batch: u64,
    current: Option<Batch>,
    /// Closed batches waiting for their flush, oldest first.
    queued: VecDeque<Batch>,
}

struct Inner {
    hooks: Arc<dyn Hooks>,
    config: ClientConfig,
    schema_config: SchemaConfig,
    codec: StringCodec,
    state: Mutex<State>,
    reader: Mutex<ResultReader>,
    /// Keeps batches reaching the backend in the order they were closed.
    flush_lock: AsyncMutex<()>,
}

/// Client session. Cheap to clone; clones share the modify batch.
#[derive(Clone)]
pub struct DbClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbClient")
            .field("schema_hash", &format!("{:016x}", self.defs().hash))
            .finish()
    }
}

/// Id of a node created in a batch that may not have been flushed yet.
#[derive(Debug)]
pub struct PendingId {
    tmp: TmpId,
    rx: OutcomeRx,
}

impl PendingId {
    /// Placeholder usable in references of the same batch.
    pub fn tmp(&self) -> TmpId {
        self.tmp
    }

    /// Wait for the flush. `None` when the batch was discarded for a stale
    /// schema.
    pub async fn resolve(self) -> Result<Option<NodeId>> {
        let offsets = match wait(self.rx).await? {
            Some(offsets) => offsets,
            None => return Ok(None),
        };
        let offset = offsets.get(&self.tmp.type_id).copied().unwrap_or(0);
        Ok(Some(self.tmp.local.saturating_add(offset)))
    }
}

/// `Some(offsets)` once applied, `None` when stale.
async fn wait(mut rx: OutcomeRx) -> Result<Option<BTreeMap<u16, u32>>> {
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| Error::Stopped)?
        .clone();
    match outcome {
        Some(BatchOutcome::Applied(offsets)) => Ok(Some(offsets)),
        Some(BatchOutcome::Stale) => Ok(None),
        Some(BatchOutcome::Failed(message)) => Err(Error::Internal { message }),
        None => Err(Error::Stopped),
    }
}

impl DbClient {
    pub fn new(hooks: Arc<dyn Hooks>) -> Result<Self> {
        Self::with_config(hooks, &Config::default())
    }

    /// The schema section must match the backend's, or every batch is
    /// rejected as stale.
    pub fn with_config(hooks: Arc<dyn Hooks>, config: &Config) -> Result<Self> {
        let schema_rx = hooks.subscribe_schema();
        let defs = Arc::new(compile(&schema_rx.borrow(), &config.schema)?);
        let codec = StringCodec::default();
        Ok(Self {
            inner: Arc::new(Inner {
                hooks,
                config: config.client.clone(),
                schema_config: config.schema.clone(),
                codec: codec.clone(),
                state: Mutex::new(State {
                    defs,
                    schema_rx,
                    last_ids: BTreeMap::new(),
                    next_batch: 1,
                    current: None,
                    queued: VecDeque::new(),
                }),
                reader: Mutex::new(ResultReader::new(codec)),
                flush_lock: AsyncMutex::new(()),
            }),
        })
    }

    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        &self.inner.hooks
    }

    /// Compiled form of the latest schema the backend announced.
    pub fn defs(&self) -> Arc<TypeDefs> {
        let mut state = self.inner.state.lock();
        self.sync_schema(&mut state);
        state.defs.clone()
    }

    fn sync_schema(&self, state: &mut State) {
        if !state.schema_rx.has_changed().unwrap_or(false) {
            return;
        }
        let schema = state.schema_rx.borrow_and_update().clone();
        match compile(&schema, &self.inner.schema_config) {
            Ok(defs) => {
                debug!(hash = %format!("{:016x}", defs.hash), "client schema updated");
                state.defs = Arc::new(defs);
            }
            Err(e) => warn!(error = %e, "announced schema does not compile"),
        }
    }

    /// Flush what is buffered, then install `schema` on the backend.
    /// Returns the hash of the merged schema.
    pub async fn set_schema(&self, schema: Schema) -> Result<u64> {
        if let Err(e) = self.drain().await {
            warn!(error = %e, "flush before schema change failed");
        }
        let hash = self.inner.hooks.set_schema(schema).await?;
        let mut state = self.inner.state.lock();
        self.sync_schema(&mut state);
        Ok(hash)
    }

    // ========== Modify ==========

    /// Serialize one operation into the open batch.
    ///
    /// A batch that would grow past `max_modify_size` is closed first and
    /// the operation goes into a fresh one.
    fn write<R>(&self, mut op: impl FnMut(&mut ModifyCtx) -> Result<R>) -> Result<(R, u64, OutcomeRx)> {
        let max = self.inner.config.max_modify_size;
        let mut state = self.inner.state.lock();
        self.sync_schema(&mut state);

        // Operations already buffered stay on the schema they were built for.
        let defs_hash = state.defs.hash;
        if state.current.as_ref().is_some_and(|b| b.ctx.defs().hash != defs_hash) {
            if let Some(old) = state.current.take() {
                state.queued.push_back(old);
            }
        }
        self.open_batch(&mut state);
        let batch = state.current.as_mut().ok_or(Error::Stopped)?;
        let mark = batch.ctx.mark();
        let out = match op(&mut batch.ctx) {
            Err(e) => {
                batch.ctx.rollback(mark);
                return Err(e);
            }
            Ok(out) if batch.ctx.len() <= max => out,
            Ok(_) if batch.ctx.ops() == 1 => {
                let size = batch.ctx.since(&mark);
                batch.ctx.rollback(mark);
                return Err(Error::BufferOverflow { size, max });
            }
            Ok(_) => {
                batch.ctx.rollback(mark);
                if let Some(full) = state.current.take() {
                    debug!(bytes = full.ctx.len(), ops = full.ctx.ops(), "modify batch full");
                    state.queued.push_back(full);
                }
                self.open_batch(&mut state);
                let batch = state.current.as_mut().ok_or(Error::Stopped)?;
                let mark = batch.ctx.mark();
                match op(&mut batch.ctx) {
                    Ok(out) if batch.ctx.len() <= max => out,
                    Ok(_) => {
                        let size = batch.ctx.since(&mark);
                        batch.ctx.rollback(mark);
                        return Err(Error::BufferOverflow { size, max });
                    }
                    Err(e) => {
                        batch.ctx.rollback(mark);
                        return Err(e);
                    }
                }
            }
        };
        let batch = state.current.as_ref().ok_or(Error::Stopped)?;
        Ok((out, batch.ctx.batch(), batch.done.subscribe()))
    }

    /// Open a batch if none is open and schedule its flush.
    fn open_batch(&self, state: &mut State) {
        if state.current.is_some() {
            return;
        }
        let id = state.next_batch;
        state.next_batch += 1;
        let ctx = ModifyCtx::new(state.defs.clone(), self.inner.codec.clone(), id, state.last_ids.clone());
        let (done, _) = watch::channel(None);
        state.current = Some(Batch { ctx, done });
        self.schedule_flush();
    }

    fn schedule_flush(&self) {
        let client = self.clone();
        let delay = self.inner.config.flush_delay;
        tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = client.drain().await {
                error!("Flush error: {:?}", e);
            }
        });
    }

    /// Hand every buffered batch to the backend, in order. Returns the
    /// first backend error; operations of the failed batch see it too.
    pub async fn drain(&self) -> Result<()> {
        let _guard = self.inner.flush_lock.lock().await;
        let mut first_err = None;
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                state.queued.pop_front().or_else(|| state.current.take())
            };
            let Some(batch) = next else { break };
            if let Err(e) = self.send(batch).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn send(&self, batch: Batch) -> Result<()> {
        let Batch { ctx, done } = batch;
        if ctx.is_empty() {
            done.send_replace(Some(BatchOutcome::Applied(BTreeMap::new())));
            return Ok(());
        }
        let local_last = ctx.last_ids().clone();
        let ops = ctx.ops();
        let buf = ctx.finish();
        let len = buf.len();

        let (outcome, result) = match self.inner.hooks.flush_modify(buf).await {
            Ok(FlushResult {
                offsets: Some(offsets),
                db_write_time,
            }) => {
                let mut state = self.inner.state.lock();
                for (type_id, offset) in &offsets {
                    let last = local_last.get(type_id).copied().unwrap_or(0).saturating_add(*offset);
                    let known = state.last_ids.entry(*type_id).or_insert(0);
                    *known = (*known).max(last);
                }
                debug!(bytes = len, ops, db_write_time, "modify batch applied");
                (BatchOutcome::Applied(offsets), Ok(()))
            }
            Ok(FlushResult { offsets: None, .. }) => {
                warn!(bytes = len, ops, "modify batch rejected, schema changed");
                (BatchOutcome::Stale, Ok(()))
            }
            Err(e) => (BatchOutcome::Failed(e.to_string()), Err(e)),
        };
        done.send_replace(Some(outcome));
        result
    }

    /// Buffer a create without waiting for the flush.
    pub fn create_deferred(&self, type_name: &str, payload: &Payload) -> Result<PendingId> {
        let ((local, type_id), batch, rx) = self.write(|ctx| {
            let type_id = ctx.defs().require(type_name)?.id;
            Ok((serialize_create(ctx, type_name, payload)?, type_id))
        })?;
        Ok(PendingId {
            tmp: TmpId { batch, type_id, local },
            rx,
        })
    }

    /// Create a node. `None` when the batch was built against a schema the
    /// backend no longer runs.
    pub async fn create(&self, type_name: &str, payload: Payload) -> Result<Option<NodeId>> {
        self.create_deferred(type_name, &payload)?.resolve().await
    }

    /// Returns whether the update reached the backend.
    pub async fn update(&self, type_name: &str, id: NodeId, payload: Payload) -> Result<bool> {
        let ((), _, rx) = self.write(|ctx| serialize_update(ctx, type_name, id, &payload))?;
        Ok(wait(rx).await?.is_some())
    }

    pub async fn delete(&self, type_name: &str, id: NodeId) -> Result<bool> {
        let ((), _, rx) = self.write(|ctx| serialize_delete(ctx, type_name, id))?;
        Ok(wait(rx).await?.is_some())
    }

    /// Update the node carrying the payload's alias, creating it when
    /// absent. Returns the id of the node either way.
    pub async fn upsert(&self, type_name: &str, payload: Payload) -> Result<Option<NodeId>> {
        self.alias_op(type_name, payload, serialize_upsert).await
    }

    /// Create the node unless one with the payload's alias exists.
    pub async fn insert(&self, type_name: &str, payload: Payload) -> Result<Option<NodeId>> {
        self.alias_op(type_name, payload, serialize_insert).await
    }

    async fn alias_op(
        &self,
        type_name: &str,
        payload: Payload,
        serialize: fn(&mut ModifyCtx, &str, &Payload) -> Result<NodeId>,
    ) -> Result<Option<NodeId>> {
        let defs = self.defs();
        let alias = defs.require(type_name)?.alias_props().find_map(|p| match payload.get(&p.path) {
            Some(Input::Value(Value::String(s))) if !s.is_empty() => Some((p.path.clone(), s.clone())),
            _ => None,
        });
        let (_, _, rx) = self.write(|ctx| serialize(ctx, type_name, &payload))?;
        if wait(rx).await?.is_none() {
            return Ok(None);
        }
        // The backend picks between the existing node and a new one.
        let Some((path, value)) = alias else { return Ok(None) };
        let found = self.query(Query::new(type_name).alias(path, value)).await?;
        Ok(found.get("id").and_then(Value::as_i64).map(|id| id as NodeId))
    }

    // ========== Query ==========

    pub async fn query(&self, query: Query) -> Result<QueryResult> {
        self.query_batch(vec![query])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal {
                message: "empty query response".to_string(),
            })
    }

    /// Run several queries in one round trip. Buffered modifies are
    /// flushed first so the results include them.
    pub async fn query_batch(&self, queries: Vec<Query>) -> Result<Vec<QueryResult>> {
        if let Err(e) = self.drain().await {
            debug!(error = %e, "querying after a failed flush");
        }
        let defs = self.defs();
        let compiled = queries
            .iter()
            .map(|q| compile_query(q.def(), &defs))
            .collect::<Result<Vec<_>>>()?;
        let buf = encode_batch(compiled.iter().map(|c| &c.plan))?;
        let out = self.inner.hooks.get_query_buf(buf.freeze()).await?;
        let readers: Vec<_> = compiled.iter().map(|c| &c.reader).collect();
        self.inner.reader.lock().read_response(&readers, &out)
    }

    /// Run `query` and return the header describing what it reads.
    pub(crate) async fn query_with_header(&self, query: &Query) -> Result<(QueryResult, SubHeader)> {
        if let Err(e) = self.drain().await {
            debug!(error = %e, "querying after a failed flush");
        }
        let compiled = compile_query(query.def(), &self.defs())?;
        let buf = encode_batch([&compiled.plan])?;
        let out = self.inner.hooks.get_query_buf(buf.freeze()).await?;
        let result = self.inner.reader.lock().read_response(&[&compiled.reader], &out)?;
        let result = result.into_iter().next().ok_or_else(|| Error::Internal {
            message: "empty query response".to_string(),
        })?;
        Ok((result, compiled.sub))
    }

    /// Live query: yields the current result, then a fresh one after every
    /// batch that touches what the query reads.
    pub fn subscribe(&self, query: Query) -> Subscription {
        Subscription::new(self.clone(), query, self.inner.hooks.subscribe_changes())
    }
}
