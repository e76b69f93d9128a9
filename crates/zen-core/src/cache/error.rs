use std::path::PathBuf;
use thiserror::Error;

use crate::error::{ErrorCode, ZenError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache key not found: {0}")]
    NotFound(String),

    #[error("cache entry '{key}' is corrupted: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("cache serialization failed: {0}")]
    Serialization(String),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("cache I/O failed at {}: {message}", path.display())]
    Permission { path: PathBuf, message: String },

    #[error("entry of {size} bytes exceeds the cache limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }

    pub(crate) fn permission(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        CacheError::Permission {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<CacheError> for ZenError {
    fn from(e: CacheError) -> Self {
        let code = match &e {
            CacheError::NotFound(_) => ErrorCode::NotFound,
            CacheError::Corrupted { .. } | CacheError::Serialization(_) => ErrorCode::InvalidData,
            CacheError::InvalidKey(_) | CacheError::TooLarge { .. } => ErrorCode::InvalidOperation,
            CacheError::Permission { .. } => ErrorCode::ConfigError,
        };
        ZenError::new(code, e.to_string())
    }
}
