//! # Error Handling
//!
//! Error types shared by every BasedDB crate.
//!
//! ## Categories
//!
//! 1. **Schema**: raised while compiling a schema, collected and reported together
//! 2. **Serialization**: raised while building modify/query byte-code, before any
//!    bytes reach the backend
//! 3. **Runtime**: backend failures (I/O, corrupt dumps, invariant violations)
//!
//! A schema-version mismatch on flush is deliberately *not* an error: the
//! client resolves the affected operations to `None` instead.

use std::fmt;

use thiserror::Error;

/// Result type alias for BasedDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for BasedDB
#[derive(Error, Debug)]
pub enum Error {
    // Schema errors
    #[error("invalid schema: {}", format_schema_errors(.errors))]
    Schema { errors: Vec<SchemaError> },

    #[error("type not found: {name}")]
    TypeNotFound { name: String },

    #[error("property not found: {type_name}.{path}")]
    PropertyNotFound { type_name: String, path: String },

    // Modify serialization errors
    #[error("invalid value for {type_name}.{path}: {message}")]
    InvalidValue {
        type_name: String,
        path: String,
        message: String,
    },

    #[error("invalid reference payload for {type_name}.{path}: {message}")]
    InvalidReference {
        type_name: String,
        path: String,
        message: String,
    },

    #[error("modify of {size} bytes exceeds max buffer size {max}")]
    BufferOverflow { size: usize, max: usize },

    // Query errors
    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("malformed {what} buffer: {message}")]
    Malformed { what: &'static str, message: String },

    #[error("checksum mismatch in {what}: expected {expected:08x}, got {actual:08x}")]
    Checksum {
        what: String,
        expected: u32,
        actual: u32,
    },

    // Merkle tree errors
    #[error("key {key} already exists in tree")]
    KeyExists { key: u64 },

    #[error("key {key} not found in tree")]
    KeyNotFound { key: u64 },

    #[error("tree is empty")]
    EmptyTree,

    #[error("tree is broken")]
    TreeBroken,

    // Block errors
    #[error("block {type_id}:{start} is not loaded")]
    BlockNotLoaded { type_id: u16, start: u32 },

    #[error("compression failed: {message}")]
    Compression { message: String },

    // System errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("server stopped")]
    Stopped,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Invariant violations and corruption are not recoverable; everything
    /// else only rejects the operation that raised it.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::TypeNotFound { .. } => false,
            Error::TreeBroken => false,
            Error::Checksum { .. } => false,
            Error::Io { .. } => false,
            Error::Internal { .. } => false,
            _ => true,
        }
    }

    /// Stable error code for callers that match on errors across a transport.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Schema { .. } => "SCHEMA_INVALID",
            Error::TypeNotFound { .. } => "TYPE_NOT_FOUND",
            Error::PropertyNotFound { .. } => "PROPERTY_NOT_FOUND",
            Error::InvalidValue { .. } => "INVALID_VALUE",
            Error::InvalidReference { .. } => "INVALID_REFERENCE",
            Error::BufferOverflow { .. } => "BUFFER_OVERFLOW",
            Error::InvalidQuery { .. } => "INVALID_QUERY",
            Error::Malformed { .. } => "MALFORMED_BUFFER",
            Error::Checksum { .. } => "CHECKSUM_MISMATCH",
            Error::KeyExists { .. } => "TREE_KEY_EXISTS",
            Error::KeyNotFound { .. } => "TREE_KEY_NOT_FOUND",
            Error::EmptyTree => "TREE_EMPTY",
            Error::TreeBroken => "TREE_BROKEN",
            Error::BlockNotLoaded { .. } => "BLOCK_NOT_LOADED",
            Error::Compression { .. } => "COMPRESSION_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Stopped => "STOPPED",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn malformed(what: &'static str, message: impl Into<String>) -> Self {
        Error::Malformed {
            what,
            message: message.into(),
        }
    }

    pub fn type_not_found(name: impl fmt::Display) -> Self {
        Error::TypeNotFound {
            name: name.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal {
            message: format!("json: {}", err),
        }
    }
}

/// A single structural problem found while compiling a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    InvalidType { path: String, kind: String },
    InvalidDefault { path: String, message: String },
    TextWithoutLocales { path: String },
    UnknownReferenceTarget { path: String, target: String },
    InverseMismatch { path: String, message: String },
    MixedReferenceTypes { path: String },
    DuplicateInverse { path: String, inverse: String },
    EdgesOnBothSides { path: String },
    InvalidEdgeName { path: String, name: String },
    TooManyProps { type_name: String },
    MainTooWide { type_name: String, len: usize },
    InvalidName { name: String },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::InvalidType { path, kind } => {
                write!(f, "{}: unknown property type {:?}", path, kind)
            }
            SchemaError::InvalidDefault { path, message } => {
                write!(f, "{}: invalid default ({})", path, message)
            }
            SchemaError::TextWithoutLocales { path } => {
                write!(f, "{}: text property requires at least one locale", path)
            }
            SchemaError::UnknownReferenceTarget { path, target } => {
                write!(f, "{}: reference target {:?} does not exist", path, target)
            }
            SchemaError::InverseMismatch { path, message } => {
                write!(f, "{}: inverse mismatch ({})", path, message)
            }
            SchemaError::MixedReferenceTypes { path } => {
                write!(f, "{}: reference and inverse must both point back at each other", path)
            }
            SchemaError::DuplicateInverse { path, inverse } => {
                write!(f, "{}: inverse {:?} is already claimed by another reference", path, inverse)
            }
            SchemaError::EdgesOnBothSides { path } => {
                write!(f, "{}: edge properties declared on both sides of the relation", path)
            }
            SchemaError::InvalidEdgeName { path, name } => {
                write!(f, "{}: edge property {:?} must start with '$'", path, name)
            }
            SchemaError::TooManyProps { type_name } => {
                write!(f, "{}: more than 250 separate properties", type_name)
            }
            SchemaError::MainTooWide { type_name, len } => {
                write!(f, "{}: main record of {} bytes exceeds {}", type_name, len, u16::MAX)
            }
            SchemaError::InvalidName { name } => write!(f, "invalid name {:?}", name),
        }
    }
}

fn format_schema_errors(errors: &[SchemaError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_errors_are_joined() {
        let err = Error::Schema {
            errors: vec![
                SchemaError::TextWithoutLocales { path: "article.body".into() },
                SchemaError::InvalidType { path: "user.x".into(), kind: "float128".into() },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("article.body"));
        assert!(msg.contains("float128"));
        assert_eq!(err.error_code(), "SCHEMA_INVALID");
    }

    #[test]
    fn test_invariant_errors_are_fatal() {
        assert!(!Error::TreeBroken.is_recoverable());
        assert!(!Error::type_not_found(7).is_recoverable());
        assert!(Error::EmptyTree.is_recoverable());
    }
}
