//! Error types for fetches, mutations and the client.

use std::sync::Arc;

/// Errors surfaced by queries, mutations and the client.
///
/// Failures coming out of a fetcher or mutator are kept as
/// `Arc<anyhow::Error>` so the same error can sit in a state cell and be
/// handed to any number of readers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryCacheError {
    /// The running fetch or mutation was cancelled.
    ///
    /// Cancellation is never recorded as an error in query or mutation
    /// state. Fetchers and mutators may also return this variant (through
    /// `anyhow`) to report that they stopped on their own.
    #[error("operation cancelled")]
    Cancelled,

    /// The fetcher or mutator failed.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    /// The query key could not be serialized into its canonical hash.
    #[error("failed to hash query key: {0}")]
    Hash(Arc<serde_json::Error>),

    /// No tokio runtime was available when building the client.
    #[error("no tokio runtime available; build the client inside a runtime or pass a handle")]
    NoRuntime,

    /// The key or mutation id is already registered with other types.
    ///
    /// Each key maps to exactly one instance, so one key cannot be used with
    /// two data or params types.
    #[error("`{key}` is registered with types other than {requested}")]
    TypeMismatch {
        /// The query hash or mutation id.
        key: String,
        /// Type name of the requested query or mutation.
        requested: &'static str,
    },

    /// The query settled without data and without an error.
    ///
    /// Returned by [`Query::ensure_data`](crate::Query::ensure_data) when the
    /// fetch it waited on was cancelled before any data was loaded.
    #[error("query has no data")]
    NoData,
}

impl QueryCacheError {
    /// Wrap a callback failure.
    ///
    /// A failure whose root cause is [`QueryCacheError::Cancelled`] stays a
    /// cancellation instead of becoming [`QueryCacheError::Failed`].
    pub fn from_callback(err: anyhow::Error) -> Self {
        if is_cancellation(&err) {
            QueryCacheError::Cancelled
        } else {
            QueryCacheError::Failed(Arc::new(err))
        }
    }

    /// Returns `true` for [`QueryCacheError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryCacheError::Cancelled)
    }

    /// Returns the callback failure if this is a `Failed` variant.
    pub fn failure(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            QueryCacheError::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the callback failure to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.failure().and_then(|e| e.downcast_ref::<E>())
    }
}

impl From<serde_json::Error> for QueryCacheError {
    fn from(err: serde_json::Error) -> Self {
        QueryCacheError::Hash(Arc::new(err))
    }
}

/// Returns `true` if a callback error signals cooperative cancellation.
pub(crate) fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(
        err.root_cause().downcast_ref::<QueryCacheError>(),
        Some(QueryCacheError::Cancelled)
    )
}
