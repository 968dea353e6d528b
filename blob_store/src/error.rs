//! Error types for blob store operations.

use std::fmt;

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug)]
pub enum BlobError {
    /// No live file, or no object behind a handle.
    NotFound { name: String },

    /// Append offset differs from the current size of the file.
    OffsetMismatch { offset: u64, size: u64 },

    /// A concurrent writer kept winning, or the target name is taken.
    Conflict { name: String },

    /// Backend name or kind that is not registered.
    UnknownBackend { name: String },

    /// Invalid or incomplete backend configuration.
    Config { reason: String },

    /// Operation the stream or backend cannot perform.
    Unsupported { operation: String },

    /// The shared transaction was already committed or rolled back.
    TransactionClosed,

    /// Storage service failure (S3/GCS/Azure/Swift/HTTP).
    Backend { source: anyhow::Error },

    Database { source: sqlx::Error },

    Io { source: std::io::Error },
}

impl BlobError {
    pub fn config(reason: impl Into<String>) -> Self {
        BlobError::Config {
            reason: reason.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        BlobError::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        BlobError::NotFound { name: name.into() }
    }

    pub fn backend(reason: impl fmt::Display) -> Self {
        BlobError::Backend {
            source: anyhow::anyhow!("{}", reason),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobError::NotFound { name } => write!(f, "file not found: {}", name),
            BlobError::OffsetMismatch { offset, size } => {
                write!(f, "offset ({}) does not match blob size ({})", offset, size)
            }
            BlobError::Conflict { name } => write!(f, "conflicting write to {}", name),
            BlobError::UnknownBackend { name } => write!(f, "unknown backend: {}", name),
            BlobError::Config { reason } => write!(f, "invalid backend configuration: {}", reason),
            BlobError::Unsupported { operation } => write!(f, "unsupported operation: {}", operation),
            BlobError::TransactionClosed => write!(f, "transaction already closed"),
            BlobError::Backend { source } => write!(f, "backend error: {}", source),
            BlobError::Database { source } => write!(f, "database error: {}", source),
            BlobError::Io { source } => write!(f, "I/O error: {}", source),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobError::Backend { source } => Some(source.as_ref()),
            BlobError::Database { source } => Some(source),
            BlobError::Io { source } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BlobError {
    fn from(err: std::io::Error) -> Self {
        BlobError::Io { source: err }
    }
}

impl From<anyhow::Error> for BlobError {
    fn from(err: anyhow::Error) -> Self {
        BlobError::Backend { source: err }
    }
}

impl From<sqlx::Error> for BlobError {
    fn from(err: sqlx::Error) -> Self {
        BlobError::Database { source: err }
    }
}

impl From<reqwest::Error> for BlobError {
    fn from(err: reqwest::Error) -> Self {
        BlobError::Backend {
            source: anyhow::Error::from(err),
        }
    }
}

impl From<object_store::Error> for BlobError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => BlobError::NotFound { name: path },
            _ => BlobError::Backend {
                source: anyhow::Error::from(err),
            },
        }
    }
}
