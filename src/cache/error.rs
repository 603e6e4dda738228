//! Error types for the cache and its persisted store

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by a cache computation
///
/// A single failure is delivered to every caller waiting on the same
/// computation, so the type is cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The upstream computation returned an error
    #[error("upstream fetch failed: {0}")]
    Upstream(Arc<dyn StdError + Send + Sync>),

    /// The upstream computation did not finish within the configured timeout
    #[error("upstream fetch for `{key}` timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    /// The computation task went away without producing a result
    #[error("upstream fetch for `{0}` was cancelled")]
    Cancelled(String),
}

impl CacheError {
    /// Wraps an upstream error
    pub fn upstream<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        CacheError::Upstream(Arc::new(err))
    }

    /// Returns the upstream error if this failure came from the computation itself
    pub fn upstream_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            CacheError::Upstream(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Errors raised by the persisted fallback store
///
/// These never leave the cache: reads that fail count as a miss and writes
/// that fail are logged and dropped.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File system error
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be encoded or decoded
    #[error("store document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
