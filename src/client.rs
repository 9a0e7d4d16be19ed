//! The query client: registry of queries and mutations.

use std::any::{type_name, Any};
use std::sync::Arc;
use std::time::Duration;

use papaya::{Compute, Operation};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::cell::Activity;
use crate::key::{QueryHash, QueryKey};
use crate::mutation::{Mutation, Mutator};
use crate::options::QueryDefaults;
use crate::persist::{Persister, Snapshot, SnapshotStore};
use crate::query::{Fetcher, Query, QueryData, QueryParams};
use crate::tracer::{NoopTracer, Tracer};
use crate::QueryCacheError;

/// State shared by the client and everything it creates.
pub(crate) struct ClientShared {
    pub runtime: Handle,
    pub defaults: QueryDefaults,
    pub fetching: Arc<Activity>,
    pub mutating: Arc<Activity>,
    pub tracer: Arc<dyn Tracer>,
    pub snapshots: Arc<SnapshotStore>,
}

type Registry<K> = papaya::HashMap<K, Arc<dyn Any + Send + Sync>, ahash::RandomState>;

/// Registry of queries and mutations.
///
/// Construct one per application with [`QueryClient::builder`] and pass it
/// to whoever needs it. Cloning is cheap and yields a handle to the same
/// registry.
///
/// # Example
///
/// ```ignore
/// let client = QueryClient::builder()
///     .stale_time(Duration::from_secs(30))
///     .persister(Arc::new(MemoryPersister::new()))
///     .build()?;
/// client.restored().await;
///
/// let todos = client.create_query(QueryKey::new("todos", ()), |_: ()| async {
///     Ok(vec!["write docs".to_string()])
/// })?;
/// let sub = todos.subscribe(QueryOptions::new());
/// ```
#[derive(Clone)]
pub struct QueryClient {
    shared: Arc<ClientShared>,
    queries: Arc<Registry<QueryHash>>,
    mutations: Arc<Registry<String>>,
}

impl QueryClient {
    /// Create a client with default settings on the current tokio runtime.
    pub fn new() -> Result<Self, QueryCacheError> {
        Self::builder().build()
    }

    /// Create a builder.
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::new()
    }

    /// The client-wide fetch policy.
    pub fn defaults(&self) -> &QueryDefaults {
        &self.shared.defaults
    }

    /// Get the query for `key`, creating it if this is the first request.
    ///
    /// Repeated calls with an equal key return the same query; `fetcher` is
    /// only used by the first one. A new query is seeded from the persisted
    /// snapshot for its hash, if one was restored.
    ///
    /// Fails with [`QueryCacheError::TypeMismatch`] if the key is already
    /// registered with other data or params types.
    pub fn create_query<D, P, F>(
        &self,
        key: QueryKey<P>,
        fetcher: F,
    ) -> Result<Query<D, P>, QueryCacheError>
    where
        D: QueryData,
        P: QueryParams,
        F: Fetcher<D, P>,
    {
        let hash = key.hash()?;
        self.get_or_create_query(key, hash, || Arc::new(fetcher) as Arc<dyn Fetcher<D, P>>)
    }

    fn get_or_create_query<D, P>(
        &self,
        key: QueryKey<P>,
        hash: QueryHash,
        fetcher: impl FnOnce() -> Arc<dyn Fetcher<D, P>>,
    ) -> Result<Query<D, P>, QueryCacheError>
    where
        D: QueryData,
        P: QueryParams,
    {
        let queries = self.queries.pin();

        // Fast path
        if let Some(existing) = queries.get(&hash) {
            return downcast_query(existing, &hash);
        }

        let seed = self.shared.snapshots.ensure(&hash);
        let candidate = Query::new(key, hash.clone(), &seed, fetcher(), self.shared.clone());
        let erased: Arc<dyn Any + Send + Sync> = Arc::new(candidate.clone());
        let result = queries.compute(hash.clone(), |entry| match entry {
            Some((_, existing)) => Operation::Abort(existing.clone()),
            None => Operation::Insert(erased.clone()),
        });

        match result {
            Compute::Inserted(_, _) => {
                self.shared.tracer.on_query_created(candidate.trace_key());
                Ok(candidate)
            }
            Compute::Aborted(existing) => downcast_query(&existing, &hash),
            Compute::Updated { .. } | Compute::Removed(_, _) => unreachable!(),
        }
    }

    /// A factory for queries sharing `id` whose params vary per call site.
    pub fn query_family<D, P, F>(&self, id: impl AsRef<str>, fetcher: F) -> QueryFamily<D, P>
    where
        D: QueryData,
        P: QueryParams,
        F: Fetcher<D, P>,
    {
        QueryFamily {
            client: self.clone(),
            id: id.as_ref().to_owned(),
            fetcher: Arc::new(fetcher),
        }
    }

    /// Get the mutation for `id`, creating it if this is the first request.
    ///
    /// Repeated calls return the same mutation; `mutator` is only used by
    /// the first one. Fails with [`QueryCacheError::TypeMismatch`] if the id
    /// is already registered with other data or params types.
    pub fn create_mutation<D, P, M>(
        &self,
        id: impl AsRef<str>,
        mutator: M,
    ) -> Result<Mutation<D, P>, QueryCacheError>
    where
        D: Send + Sync + 'static,
        P: Send + Sync + 'static,
        M: Mutator<D, P>,
    {
        let id = id.as_ref();
        let mutations = self.mutations.pin();

        // Fast path
        if let Some(existing) = mutations.get(id) {
            return downcast_mutation(existing, id);
        }

        let candidate = Mutation::new(id.to_owned(), Arc::new(mutator), self.shared.clone());
        let erased: Arc<dyn Any + Send + Sync> = Arc::new(candidate.clone());
        let result = mutations.compute(id.to_owned(), |entry| match entry {
            Some((_, existing)) => Operation::Abort(existing.clone()),
            None => Operation::Insert(erased.clone()),
        });

        match result {
            Compute::Inserted(_, _) => {
                self.shared.tracer.on_mutation_created(id);
                Ok(candidate)
            }
            Compute::Aborted(existing) => downcast_mutation(&existing, id),
            Compute::Updated { .. } | Compute::Removed(_, _) => unreachable!(),
        }
    }

    /// Whether any query is fetching.
    pub fn is_fetching(&self) -> bool {
        self.shared.fetching.is_active()
    }

    /// Subscribe to [`is_fetching`](QueryClient::is_fetching).
    pub fn watch_fetching(&self) -> watch::Receiver<bool> {
        self.shared.fetching.subscribe()
    }

    /// Whether any mutation instance is running.
    pub fn is_mutating(&self) -> bool {
        self.shared.mutating.is_active()
    }

    /// Subscribe to [`is_mutating`](QueryClient::is_mutating).
    pub fn watch_mutating(&self) -> watch::Receiver<bool> {
        self.shared.mutating.subscribe()
    }

    /// Wait until the persisted snapshots have been loaded.
    ///
    /// Resolves immediately without a persister. Queries created earlier
    /// were seeded from empty snapshots.
    pub async fn restored(&self) {
        let mut restored = self.shared.snapshots.restored();
        // The sender lives as long as the store.
        let _ = restored.wait_for(|done| *done).await;
    }

    /// Wait until every snapshot write issued so far reached the persister.
    pub async fn flush(&self) {
        self.shared.snapshots.flush().await;
    }

    /// The in-memory snapshot for `hash`.
    pub fn snapshot(&self, hash: &QueryHash) -> Option<Snapshot> {
        self.shared.snapshots.get(hash)
    }
}

fn downcast_query<D: QueryData, P: QueryParams>(
    erased: &Arc<dyn Any + Send + Sync>,
    hash: &QueryHash,
) -> Result<Query<D, P>, QueryCacheError> {
    erased
        .downcast_ref::<Query<D, P>>()
        .cloned()
        .ok_or_else(|| QueryCacheError::TypeMismatch {
            key: hash.to_string(),
            requested: type_name::<Query<D, P>>(),
        })
}

fn downcast_mutation<D: Send + Sync + 'static, P: Send + Sync + 'static>(
    erased: &Arc<dyn Any + Send + Sync>,
    id: &str,
) -> Result<Mutation<D, P>, QueryCacheError> {
    erased
        .downcast_ref::<Mutation<D, P>>()
        .cloned()
        .ok_or_else(|| QueryCacheError::TypeMismatch {
            key: id.to_owned(),
            requested: type_name::<Mutation<D, P>>(),
        })
}

/// Queries sharing one id, created per params.
///
/// Returned by [`QueryClient::query_family`].
pub struct QueryFamily<D, P> {
    client: QueryClient,
    id: String,
    fetcher: Arc<dyn Fetcher<D, P>>,
}

impl<D: QueryData, P: QueryParams> QueryFamily<D, P> {
    /// The shared id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get or create the query for `params`.
    pub fn get(&self, params: P) -> Result<Query<D, P>, QueryCacheError> {
        let key = QueryKey::new(&self.id, params);
        let hash = key.hash()?;
        self.client
            .get_or_create_query(key, hash, || self.fetcher.clone())
    }
}

impl<D, P> Clone for QueryFamily<D, P> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            id: self.id.clone(),
            fetcher: self.fetcher.clone(),
        }
    }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    defaults: QueryDefaults,
    persister: Option<Arc<dyn Persister>>,
    tracer: Arc<dyn Tracer>,
    runtime: Option<Handle>,
}

impl Default for QueryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            defaults: QueryDefaults::default(),
            persister: None,
            tracer: Arc::new(NoopTracer),
            runtime: None,
        }
    }

    /// Replace the whole fetch policy.
    pub fn defaults(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Set the default stale time.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.defaults.stale_time = stale_time;
        self
    }

    /// Set whether subscriptions fetch automatically by default.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.defaults.enabled = enabled;
        self
    }

    /// Set the default retry count.
    pub fn retries(mut self, retries: u32) -> Self {
        self.defaults.retries = retries;
        self
    }

    /// Persist query snapshots to `persister`.
    pub fn persister(mut self, persister: Arc<dyn Persister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Set the tracer for observing execution.
    pub fn tracer<T: Tracer>(mut self, tracer: T) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Run tasks on `runtime` instead of the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the client and start loading persisted snapshots.
    ///
    /// Fails with [`QueryCacheError::NoRuntime`] if no runtime was given and
    /// the caller is not inside one.
    pub fn build(self) -> Result<QueryClient, QueryCacheError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| QueryCacheError::NoRuntime)?,
        };
        let snapshots = Arc::new(SnapshotStore::start(self.persister, &runtime));

        Ok(QueryClient {
            shared: Arc::new(ClientShared {
                runtime,
                defaults: self.defaults,
                fetching: Arc::new(Activity::new()),
                mutating: Arc::new(Activity::new()),
                tracer: self.tracer,
                snapshots,
            }),
            queries: Arc::new(Registry::<QueryHash>::with_hasher(ahash::RandomState::new())),
            mutations: Arc::new(Registry::<String>::with_hasher(ahash::RandomState::new())),
        })
    }
}
