//! # Database server
//!
//! Owns the [`Db`] and exposes it through the [`Hooks`] boundary. Also
//! persists: block dumps, `common.sdb`, `schema.json` and `writelog.json`
//! under the configured data directory.
//!
//! ```text
//! DbClient ──hooks──> DbServer ──lock──> Db
//!                        │
//!                        ├─ save task (interval, watch shutdown)
//!                        ├─ schema watch
//!                        └─ change broadcast
//! ```

use std::path::Path;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use basedb_core::metrics::{Metrics, MetricsSnapshot, Timer};
use basedb_core::{compile, ChangeSet, Config, FlushResult, Hooks, NodeId, Result, Schema, TypeDefs};

use crate::block_map::DirtyBlock;
use crate::db::{Db, VerifyReport};
use crate::dump::COMMON_FILE;
use crate::writelog::{LogLevel, WriteLog, SCHEMA_FILE};

const CHANGES_CAPACITY: usize = 1024;

struct Inner {
    db: Mutex<Db>,
    config: Config,
    metrics: Metrics,
    schema_tx: watch::Sender<Schema>,
    changes_tx: broadcast::Sender<ChangeSet>,
    shutdown: watch::Sender<bool>,
    /// Serializes saves and schema changes.
    save_lock: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// In-process backend. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DbServer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DbServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbServer")
            .field("data_dir", &self.inner.config.storage.data_dir)
            .finish()
    }
}

impl DbServer {
    /// Open (or create) the database in `config.storage.data_dir`.
    pub async fn open(config: Config) -> Result<Self> {
        let dir = config.storage.data_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;

        let schema = match tokio::fs::read(dir.join(SCHEMA_FILE)).await {
            Ok(data) => serde_json::from_slice::<Schema>(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Schema::default(),
            Err(e) => return Err(e.into()),
        };
        let defs = Arc::new(compile(&schema, &config.schema)?);
        info!(types = defs.types().count(), hash = %format!("{:016x}", defs.hash), "opening database");

        let metrics = Metrics::new();
        let mut db = Db::new(
            defs,
            &config.storage,
            config.schema.string_compression_threshold,
            metrics.clone(),
        );
        let log = WriteLog::load(&dir).await?;
        db.open_dumps(log, config.storage.no_load_dumps)?;

        let (schema_tx, _) = watch::channel(schema);
        let (changes_tx, _) = broadcast::channel(CHANGES_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let server = Self {
            inner: Arc::new(Inner {
                db: Mutex::new(db),
                config,
                metrics,
                schema_tx,
                changes_tx,
                shutdown,
                save_lock: tokio::sync::Mutex::new(()),
            }),
        };
        server.start_save_task();
        Ok(server)
    }

    fn start_save_task(&self) {
        let Some(every) = self.inner.config.storage.save_interval else {
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let mut save_interval = interval(every);
            save_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            save_interval.tick().await;

            loop {
                tokio::select! {
                    _ = save_interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let server = DbServer { inner };
                        if let Err(e) = server.save().await {
                            error!("Save error: {:?}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Shutting down save task");
                        break;
                    }
                }
            }
        });
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.config.storage.data_dir
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// The active schema.
    pub fn schema(&self) -> Schema {
        self.inner.schema_tx.borrow().clone()
    }

    pub fn defs(&self) -> Arc<TypeDefs> {
        self.inner.db.lock().defs().clone()
    }

    pub fn root_hash(&self) -> basedb_core::hash::Hash {
        self.inner.db.lock().root_hash()
    }

    pub fn dirty_blocks(&self) -> Vec<DirtyBlock> {
        self.inner.db.lock().blocks().dirty_blocks()
    }

    pub fn dirty_types(&self) -> Vec<u16> {
        self.inner.db.lock().blocks().dirty_types()
    }

    /// Loaded nodes of a type.
    pub fn count(&self, type_name: &str) -> Result<usize> {
        let db = self.inner.db.lock();
        let id = db.defs().require(type_name)?.id;
        db.count(id)
    }

    /// Run a closure against the locked database state.
    pub fn with_db<R>(&self, f: impl FnOnce(&Db) -> R) -> R {
        f(&self.inner.db.lock())
    }

    /// Write every dirty block, `common.sdb` and the write log. Returns the
    /// number of dump files written or removed.
    pub async fn save(&self) -> Result<usize> {
        let _guard = self.inner.save_lock.lock().await;
        let plan = self.inner.db.lock().prepare_save()?;
        let dir = self.data_dir().to_path_buf();

        let mut written = 0;
        for (i, dump) in plan.dumps.iter().enumerate() {
            let path = dump.info.path(&dir);
            let res = match &dump.bytes {
                Some(bytes) => write_atomic(&path, bytes).await,
                None => remove_file(&path).await,
            };
            if let Err(e) = res {
                error!(file = %dump.info.file_name(), error = %e, "failed to write block dump");
                let mut db = self.inner.db.lock();
                for failed in &plan.dumps[i..] {
                    db.save_failed(failed.key);
                }
                return Err(e);
            }
            written += 1;
        }
        write_atomic(&dir.join(COMMON_FILE), &plan.common).await?;
        plan.log.save(&dir).await?;

        self.inner.metrics.record_blocks_saved(written as u64);
        if written > 0 {
            info!(blocks = written, root = %plan.log.root, "saved");
        }
        Ok(written)
    }

    /// Bring the block holding `id` into memory. Returns the number of
    /// nodes loaded.
    pub fn load_block(&self, type_name: &str, id: NodeId) -> Result<usize> {
        let mut db = self.inner.db.lock();
        let def = db.defs().require(type_name)?;
        let (type_id, start) = (def.id, basedb_core::block::block_start(id, def.block_capacity));
        db.load_block(type_id, start)
    }

    /// Evict the block holding `id`, saving first when it has unsaved
    /// changes. Returns the number of nodes evicted.
    pub async fn unload_block(&self, type_name: &str, id: NodeId) -> Result<usize> {
        let (type_id, start, dirty) = {
            let db = self.inner.db.lock();
            let def = db.defs().require(type_name)?;
            let start = basedb_core::block::block_start(id, def.block_capacity);
            let key = basedb_core::block::block_key(def.id, start);
            (def.id, start, db.blocks().get(key)?.is_some_and(|s| s.dirty))
        };
        if dirty {
            self.save().await?;
        }
        self.inner.db.lock().unload_block(type_id, start)
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        let report = self.inner.db.lock().verify()?;
        if !report.is_ok() {
            warn!(mismatched = report.mismatched.len(), root_matches = report.root_matches, "verify failed");
        }
        Ok(report)
    }

    /// Save outstanding changes and stop the background task.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.inner.shutdown.send(true);
        self.save().await?;
        info!("database stopped");
        Ok(())
    }
}

#[async_trait]
impl Hooks for DbServer {
    async fn set_schema(&self, schema: Schema) -> Result<u64> {
        let _guard = self.inner.save_lock.lock().await;
        let merged = self.inner.schema_tx.borrow().merge(&schema);
        let defs = Arc::new(compile(&merged, &self.inner.config.schema)?);
        let hash = defs.hash;

        let removed = {
            let mut db = self.inner.db.lock();
            if db.defs().hash == hash {
                debug!(hash = %format!("{:016x}", hash), "schema unchanged");
                return Ok(hash);
            }
            let report = db.migrate(defs)?;
            db.log.record(
                LogLevel::Info,
                "set_schema",
                format!("schema installed, {} types migrated", report.changed.len()),
                Some(format!("{:016x}", hash)),
            );
            report.removed
        };

        let dir = self.data_dir().to_path_buf();
        for info in removed {
            remove_file(&info.path(&dir)).await?;
        }
        write_atomic(&dir.join(SCHEMA_FILE), &serde_json::to_vec_pretty(&merged)?).await?;
        self.inner.schema_tx.send_replace(merged);
        info!(hash = %format!("{:016x}", hash), "schema installed");
        Ok(hash)
    }

    async fn flush_modify(&self, buf: Bytes) -> Result<FlushResult> {
        let timer = Timer::new("flush_modify");
        let outcome = self.inner.db.lock().apply_modify(&buf)?;
        let Some(outcome) = outcome else {
            warn!(bytes = buf.len(), "modify batch built for a stale schema, discarded");
            return Ok(FlushResult::schema_mismatch());
        };
        let changes = outcome.changes;
        if !(changes.props.is_empty() && changes.main.is_empty() && changes.structural.is_empty()) {
            // No receivers is fine.
            let _ = self.inner.changes_tx.send(changes);
        }
        let elapsed = timer.stop();
        debug!(bytes = buf.len(), created = outcome.created, elapsed_ms = elapsed, "applied modify batch");
        Ok(FlushResult {
            offsets: Some(outcome.offsets),
            db_write_time: Some(elapsed),
        })
    }

    async fn get_query_buf(&self, buf: Bytes) -> Result<Bytes> {
        let out = self.inner.db.lock().execute_batch(&buf)?;
        Ok(out)
    }

    fn subscribe_schema(&self) -> watch::Receiver<Schema> {
        self.inner.schema_tx.subscribe()
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeSet> {
        self.inner.changes_tx.subscribe()
    }
}

/// Write through a temp file and rename.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
