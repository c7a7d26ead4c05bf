//! # BasedDB Storage
//!
//! The backend half of BasedDB: node storage, persistence, integrity and
//! execution of modify and query batches.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Write Path                              │
//! │                                                              │
//! │  Modify batch ──> Applier ──> TypeStore ──> BlockMap (dirty) │
//! │                                  │                           │
//! │                                  ▼ save                      │
//! │                        <type>_<start>_<end>.sdb ──> Csmt     │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Read Path                               │
//! │                                                              │
//! │  Query batch ──> filter ──> search/sort ──> include ──> bytes│
//! │                                  └──> aggregate ─────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod apply;
pub mod block_map;
pub mod csmt;
pub mod db;
pub mod distance;
pub mod dump;
mod exec;
pub mod migrate;
pub mod server;
pub mod store;
pub mod writelog;

pub use apply::ApplyOutcome;
pub use block_map::{BlockMap, BlockState, DirtyBlock};
pub use csmt::Csmt;
pub use db::{Db, VerifyReport};
pub use dump::DumpInfo;
pub use migrate::MigrateReport;
pub use server::DbServer;
pub use writelog::{LogEntry, LogFilter, LogLevel, SortOrder, WriteLog};
