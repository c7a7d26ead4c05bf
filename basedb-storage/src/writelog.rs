//! # Write log
//!
//! `writelog.json` records what the last save left on disk: per-type
//! counters, every block with its content hash, the CSMT root and the schema
//! hash. It also keeps a bounded history of lifecycle events, which
//! `basedb logs filter` reads.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use basedb_core::hash::{from_hex, to_hex, Hash};
use basedb_core::timestamp::now_ms;
use basedb_core::Result;

pub const WRITELOG_FILE: &str = "writelog.json";
pub const SCHEMA_FILE: &str = "schema.json";

const HISTORY_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteLog {
    pub version: u64,
    pub schema_hash: u64,
    /// Hex CSMT root.
    pub root: String,
    pub types: BTreeMap<u16, TypeEntry>,
    pub blocks: Vec<BlockEntry>,
    #[serde(default)]
    pub history: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeEntry {
    pub name: String,
    pub last_id: u32,
    pub block_capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub type_id: u16,
    pub start: u32,
    pub end: u32,
    pub hash: String,
}

impl BlockEntry {
    pub fn hash(&self) -> Result<Hash> {
        from_hex(&self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Epoch milliseconds.
    pub ts: i64,
    pub level: LogLevel,
    /// Operation that produced the entry (`save`, `set_schema`, ...).
    pub function: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => return None,
        })
    }
}

impl WriteLog {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(WRITELOG_FILE)
    }

    pub fn root_hash(&self) -> Result<Hash> {
        from_hex(&self.root)
    }

    pub fn set_root(&mut self, root: &Hash) {
        self.root = to_hex(root);
    }

    pub fn record(&mut self, level: LogLevel, function: &str, message: impl Into<String>, checksum: Option<String>) {
        self.history.push(LogEntry {
            ts: now_ms(),
            level,
            function: function.to_string(),
            message: message.into(),
            checksum,
        });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file so a crash never leaves a torn log.
    pub async fn save(&self, dir: &Path) -> Result<()> {
        let path = Self::path(dir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// History query used by `basedb logs filter`.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Minimum level.
    pub level: Option<LogLevel>,
    pub function: Option<String>,
    pub checksum: Option<String>,
    pub limit: Option<usize>,
    pub sort: SortOrder,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.start.map_or(true, |s| entry.ts >= s)
            && self.end.map_or(true, |e| entry.ts <= e)
            && self.level.map_or(true, |l| entry.level >= l)
            && self.function.as_deref().map_or(true, |f| entry.function == f)
            && self
                .checksum
                .as_deref()
                .map_or(true, |c| entry.checksum.as_deref().is_some_and(|e| e.starts_with(c)))
    }

    pub fn apply<'a>(&self, history: &'a [LogEntry]) -> Vec<&'a LogEntry> {
        let mut out: Vec<&LogEntry> = history.iter().filter(|e| self.matches(e)).collect();
        out.sort_by_key(|e| e.ts);
        if self.sort == SortOrder::Desc {
            out.reverse();
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}
