//! Key types for query identity.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::QueryCacheError;

/// Identity of a query: an id plus the parameters passed to its fetcher.
///
/// Two keys are equal iff both the id and the params are equal. Any id that
/// can be viewed as a string works, so closed sets of ids (enums) only need
/// an `AsRef<str>` implementation returning their label.
///
/// # Example
///
/// ```ignore
/// enum Route {
///     Todos,
/// }
///
/// impl AsRef<str> for Route {
///     fn as_ref(&self) -> &str {
///         match self {
///             Route::Todos => "Todos",
///         }
///     }
/// }
///
/// let key = QueryKey::new(Route::Todos, 3u32);
/// assert_eq!(key, QueryKey::new("Todos", 3u32));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QueryKey<P> {
    id: String,
    params: P,
}

impl<P> QueryKey<P> {
    /// Create a key from an id and params.
    pub fn new(id: impl AsRef<str>, params: P) -> Self {
        Self {
            id: id.as_ref().to_owned(),
            params,
        }
    }

    /// The id label.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The params passed to the fetcher.
    pub fn params(&self) -> &P {
        &self.params
    }
}

impl QueryKey<()> {
    /// Create a key for a query that takes no params.
    pub fn from_id(id: impl AsRef<str>) -> Self {
        Self::new(id, ())
    }
}

impl<P: Serialize> QueryKey<P> {
    /// Compute the canonical hash of this key.
    ///
    /// The key is converted to a `serde_json::Value` first, whose objects keep
    /// their entries sorted, so params that are structurally equal hash to the
    /// same string no matter how their maps were built.
    pub fn hash(&self) -> Result<QueryHash, QueryCacheError> {
        let value = serde_json::to_value(self)?;
        Ok(QueryHash(serde_json::to_string(&value)?.into()))
    }
}

/// Canonical serialized form of a [`QueryKey`].
///
/// This is the join key between queries and their persisted snapshots.
/// Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHash(Arc<str>);

impl QueryHash {
    /// Wrap an already computed hash, e.g. one read back from a persister.
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    /// The hash as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for QueryHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
