//! # Configuration Management
//!
//! Handles all configuration for BasedDB components.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub client: ClientConfig,
    pub schema: SchemaConfig,
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for
    /// missing sections.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| Error::Configuration {
            message: format!("{}: {}", path.display(), e),
        })
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Register dumps on open without loading them into memory.
    pub no_load_dumps: bool,
    /// Interval of the background save task; `None` disables it.
    pub save_interval: Option<Duration>,
    pub compression: CompressionConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            no_load_dumps: false,
            save_interval: None,
            compression: CompressionConfig::default(),
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            level: 3,
        }
    }
}

/// Compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Zstd,
    Snappy,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// A batch is handed to the backend once it grows past this size.
    pub max_modify_size: usize,
    /// Delay between the first buffered operation and the automatic flush.
    pub flush_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_modify_size: 100 * 1024 * 1024, // 100MB
            flush_delay: Duration::ZERO,
        }
    }
}

/// Schema compilation knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub default_block_capacity: u32,
    /// Strings longer than this are compressed when the property allows it.
    pub string_compression_threshold: usize,
    /// Strings with a declared `max_bytes` up to this size are packed into
    /// the main record.
    pub fixed_string_max: u16,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            default_block_capacity: 100_000,
            string_compression_threshold: 200,
            fixed_string_max: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"storage": {"data_dir": "/tmp/x", "no_load_dumps": true}}"#)
                .unwrap();
        assert!(cfg.storage.no_load_dumps);
        assert_eq!(cfg.storage.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.schema.default_block_capacity, 100_000);
        assert_eq!(cfg.client.max_modify_size, 100 * 1024 * 1024);
    }
}
