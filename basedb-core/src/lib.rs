//! # BasedDB Core
//!
//! Building blocks shared by every BasedDB crate:
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   basedb-core                   │
//! ├─────────────────────────────────────────────────┤
//! │  • schema      - declarative schema + compiler  │
//! │  • codec       - little-endian primitives       │
//! │  • string      - string field encoding          │
//! │  • hash        - BLAKE3 / CRC32 / xxHash64      │
//! │  • compression - block + field compression      │
//! │  • block       - block addressing               │
//! │  • hooks       - client ↔ backend boundary      │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod hash;
pub mod hooks;
pub mod metrics;
pub mod schema;
pub mod string;
pub mod timestamp;
pub mod value;

pub use config::Config;
pub use error::{Error, Result, SchemaError};
pub use hooks::{ChangeSet, FlushResult, Hooks};
pub use schema::{compile, PropDef, PropKind, PropSchema, Schema, TypeDef, TypeDefs, TypeSchema};
pub use value::{NodeId, Row, Value};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Bumped whenever a byte-code or dump layout changes.
pub const PROTOCOL_VERSION: u32 = 1;
