//! Queries: cached, keyed, asynchronous reads.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client::ClientShared;
use crate::key::{QueryHash, QueryKey};
use crate::options::{QueryDefaults, QueryOptions};
use crate::persist::{Snapshot, SnapshotWriter};
use crate::state::{expires_immediately, now, QueryState, Timestamp};
use crate::task::{settle, Settled, TaskDone, TaskSlot};
use crate::tracer::{FetchOutcome, TracerQueryKey};
use crate::QueryCacheError;

/// Loads the data of a query.
///
/// Implemented for any `Fn(P) -> impl Future<Output = anyhow::Result<D>>`,
/// so plain async closures work:
///
/// ```ignore
/// let todos = client.create_query(QueryKey::new("todos", 1u32), |page: u32| async move {
///     api::list_todos(page).await
/// })?;
/// ```
///
/// A fetch is cancelled by dropping its future at an `.await` point. Timeouts
/// are the fetcher's own business.
#[async_trait]
pub trait Fetcher<D, P>: Send + Sync + 'static {
    /// Fetch the data for `params`.
    async fn fetch(&self, params: &P) -> anyhow::Result<D>;
}

#[async_trait]
impl<D, P, F, Fut> Fetcher<D, P> for F
where
    D: Send + 'static,
    P: Clone + Send + Sync + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<D>> + Send,
{
    async fn fetch(&self, params: &P) -> anyhow::Result<D> {
        (self)(params.clone()).await
    }
}

/// Convenience trait for query data types.
///
/// Data is cloned out to readers and serialized into snapshots:
/// `Serialize + DeserializeOwned + Clone + Send + Sync + 'static`.
pub trait QueryData: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> QueryData for T {}

/// Convenience trait for query params types.
///
/// Params are part of the key hash and are handed to the fetcher:
/// `Serialize + Clone + Send + Sync + 'static`.
pub trait QueryParams: Serialize + Clone + Send + Sync + 'static {}
impl<T: Serialize + Clone + Send + Sync + 'static> QueryParams for T {}

/// A cached, keyed, asynchronous read.
///
/// Created through [`QueryClient::create_query`](crate::QueryClient::create_query),
/// which hands out the same instance for equal keys. Cheap to clone.
///
/// At most one fetch runs per query: starting a fetch cancels the running
/// one, and the new fetch begins once the old one has settled.
pub struct Query<D, P> {
    inner: Arc<QueryInner<D, P>>,
}

struct QueryInner<D, P> {
    key: QueryKey<P>,
    hash: QueryHash,
    trace_key: TracerQueryKey,
    state: QueryState<D>,
    fetcher: Arc<dyn Fetcher<D, P>>,
    snapshot: SnapshotWriter,
    task: TaskSlot,
    shared: Arc<ClientShared>,
}

impl<D, P> Clone for Query<D, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D, P> Query<D, P> {
    /// The key this query was created with.
    pub fn key(&self) -> &QueryKey<P> {
        &self.inner.key
    }

    /// Canonical hash of the key, also the persistence key.
    pub fn hash(&self) -> &QueryHash {
        &self.inner.hash
    }

    /// The observable state.
    pub fn state(&self) -> &QueryState<D> {
        &self.inner.state
    }

    /// Cancel the running fetch. No-op if nothing is running.
    pub fn cancel(&self) {
        self.inner.task.cancel();
    }

    /// Mark the data as outdated.
    ///
    /// Does not fetch by itself; subscriptions react to the flag.
    pub fn invalidate(&self) {
        self.inner.state.invalidated.set(true);
    }

    /// Wait for the running fetch, if any, to settle.
    pub async fn settled(&self) {
        self.inner.task.settled().await;
    }

    /// Whether the data is stale for the given `stale_time`, right now.
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.inner.state.is_stale_at(stale_time, now())
    }

    /// Whether a subscription using `options` should fetch at time `now`.
    pub fn should_fetch(&self, options: &QueryDefaults, now: Timestamp) -> bool {
        options.enabled && self.inner.state.is_stale_at(options.stale_time, now)
    }

    /// Returns `true` if both handles point to the same query.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<D: Clone, P> Query<D, P> {
    /// The current data.
    pub fn data(&self) -> Option<D> {
        self.inner.state.data.get()
    }
}

impl<D: QueryData, P: QueryParams> Query<D, P> {
    pub(crate) fn new(
        key: QueryKey<P>,
        hash: QueryHash,
        seed: &Snapshot,
        fetcher: Arc<dyn Fetcher<D, P>>,
        shared: Arc<ClientShared>,
    ) -> Self {
        let decoded = seed.data.clone().map(serde_json::from_value::<D>).transpose();
        let (data, updated_at) = match decoded {
            Ok(data) => (data, seed.updated_at),
            Err(e) => {
                tracing::warn!(%hash, error = %e, "ignoring undecodable snapshot data");
                (None, 0)
            }
        };

        Self {
            inner: Arc::new(QueryInner {
                trace_key: TracerQueryKey::new(key.id(), hash.clone()),
                snapshot: shared.snapshots.writer_for(hash.clone()),
                key,
                hash,
                state: QueryState::new(data, updated_at),
                fetcher,
                task: TaskSlot::new(),
                shared,
            }),
        }
    }

    pub(crate) fn trace_key(&self) -> &TracerQueryKey {
        &self.inner.trace_key
    }

    /// Start fetching in the background, without retries.
    pub fn fetch(&self) {
        self.fetch_with_retry(0);
    }

    /// Start fetching in the background, retrying up to `retries` times.
    ///
    /// The outcome of the last attempt is what ends up in the state.
    pub fn fetch_with_retry(&self, retries: u32) {
        let _ = self.start(retries);
    }

    fn start(&self, retries: u32) -> TaskDone {
        let query = self.clone();
        self.inner
            .task
            .replace(&self.inner.shared.runtime, move |token| async move {
                // Cancellation was already logged and traced.
                let _ = query.run_fetch(retries, &token).await;
            })
    }

    /// Return the data, fetching first if the query was never fetched.
    ///
    /// Fails with the stored error if the query ends up in the error state,
    /// and with [`QueryCacheError::NoData`] if the fetch was cancelled before
    /// any data arrived. Dropping the returned future does not cancel the
    /// fetch it started.
    pub async fn ensure_data(&self) -> Result<D, QueryCacheError> {
        let state = &self.inner.state;
        if !state.is_first_fetched.get() {
            self.start(0).await;
            // A newer fetch may have superseded ours.
            self.settled().await;
        }

        if state.is_error.get() {
            if let Some(error) = state.error.get() {
                return Err(QueryCacheError::Failed(error));
            }
        }
        self.data().ok_or(QueryCacheError::NoData)
    }

    /// Run one fetch task: raise the loading flag, fetch with retries, and
    /// record the outcome.
    ///
    /// Returns `Err(Cancelled)` if the task was cancelled; failures are
    /// recorded in the state, not returned.
    async fn run_fetch(
        &self,
        retries: u32,
        token: &CancellationToken,
    ) -> Result<(), QueryCacheError> {
        let inner = &self.inner;
        let loading = inner.state.loading_flag();
        loading.set(true);
        let active = inner.shared.fetching.track();

        let (result, outcome) = match self.fetch_attempts(retries, token).await {
            Settled::Done(data) => {
                self.record_success(data);
                (Ok(()), FetchOutcome::Success)
            }
            Settled::Failed(error) => {
                tracing::error!(query = %inner.hash, error = %error, "fetch failed");
                let message = error.to_string();
                self.record_failure(error);
                (Ok(()), FetchOutcome::Error { message })
            }
            Settled::Cancelled => {
                tracing::debug!(query = %inner.hash, "fetch cancelled");
                (Err(QueryCacheError::Cancelled), FetchOutcome::Cancelled)
            }
        };

        loading.set(false);
        drop(active);
        inner.shared.tracer.on_fetch_end(&inner.trace_key, &outcome);
        result
    }

    async fn fetch_attempts(&self, retries: u32, token: &CancellationToken) -> Settled<D> {
        let inner = &self.inner;
        let mut attempt = 0;
        loop {
            inner.shared.tracer.on_fetch_attempt(&inner.trace_key, attempt);
            match settle(token, inner.fetcher.fetch(inner.key.params())).await {
                Settled::Failed(error) if attempt < retries => {
                    attempt += 1;
                    tracing::debug!(query = %inner.hash, attempt, error = %error, "retrying fetch");
                }
                settled => return settled,
            }
        }
    }

    fn record_success(&self, data: D) {
        let inner = &self.inner;
        let state = &inner.state;
        inner.snapshot.data_changed(Some(&data));
        state.data.set(Some(data));
        state.error.set(None);
        state.set_outcome(true);
        state.invalidated.set_if_changed(false);

        let updated_at = now();
        state.updated_at.set(updated_at);
        inner.snapshot.updated_at_changed(updated_at);
        state.is_first_fetched.set_if_changed(true);
    }

    fn record_failure(&self, error: Arc<anyhow::Error>) {
        let inner = &self.inner;
        let state = &inner.state;
        state.data.set(None);
        inner.snapshot.data_changed::<D>(None);
        state.error.set(Some(error));
        state.set_outcome(false);
    }

    /// Bind the query to a consumer.
    ///
    /// Fetches right away if enabled and stale, then again whenever the
    /// query turns stale through a change of `updated_at`,
    /// `is_first_fetched` or `invalidated`. An explicit [`invalidate`]
    /// restarts a running fetch. Dropping or disposing the subscription
    /// cancels the query's running fetch.
    ///
    /// [`invalidate`]: Query::invalidate
    pub fn subscribe(&self, options: QueryOptions) -> QuerySubscription<D, P> {
        let options = options.resolve(&self.inner.shared.defaults);
        let stop = CancellationToken::new();

        if options.enabled {
            let state = &self.inner.state;
            let watched = Watched {
                updated_at: state.updated_at.subscribe(),
                is_first_fetched: state.is_first_fetched.subscribe(),
                invalidated: state.invalidated.subscribe(),
            };
            if self.should_fetch(&options, now()) {
                self.fetch_with_retry(options.retries);
            }
            self.inner.shared.runtime.spawn(watch_staleness(
                self.clone(),
                options,
                stop.clone(),
                watched,
            ));
        }

        QuerySubscription {
            query: self.clone(),
            options,
            stop,
        }
    }
}

struct Watched {
    updated_at: watch::Receiver<Timestamp>,
    is_first_fetched: watch::Receiver<bool>,
    invalidated: watch::Receiver<bool>,
}

async fn watch_staleness<D: QueryData, P: QueryParams>(
    query: Query<D, P>,
    options: QueryDefaults,
    stop: CancellationToken,
    mut watched: Watched,
) {
    loop {
        let restart = tokio::select! {
            _ = stop.cancelled() => return,
            changed = watched.updated_at.changed() => {
                if changed.is_err() { return; }
                false
            }
            changed = watched.is_first_fetched.changed() => {
                if changed.is_err() { return; }
                false
            }
            changed = watched.invalidated.changed() => {
                if changed.is_err() { return; }
                *watched.invalidated.borrow()
            }
        };

        // Intermediate changes made by a running fetch are ignored; it leaves
        // the state fresh or failed. When fresh data is already stale, only
        // invalidation refetches.
        let state = query.state();
        let recheck = !expires_immediately(options.stale_time) && !state.is_fetching();
        if restart || (recheck && query.should_fetch(&options, now())) {
            query.fetch_with_retry(options.retries);
        }
    }
}

/// A consumer's binding to a [`Query`].
///
/// Exposes the state reads a UI layer needs. Dropping it stops the
/// staleness watch and cancels the query's running fetch.
pub struct QuerySubscription<D, P> {
    query: Query<D, P>,
    options: QueryDefaults,
    stop: CancellationToken,
}

impl<D, P> QuerySubscription<D, P> {
    /// The subscribed query.
    pub fn query(&self) -> &Query<D, P> {
        &self.query
    }

    /// The resolved options of this subscription.
    pub fn options(&self) -> &QueryDefaults {
        &self.options
    }

    /// The current error.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.query.state().error.get()
    }

    /// Whether the last fetch succeeded.
    pub fn is_success(&self) -> bool {
        self.query.state().is_success.get()
    }

    /// Whether the last fetch failed.
    pub fn is_error(&self) -> bool {
        self.query.state().is_error.get()
    }

    /// Whether a refetch is running.
    pub fn is_refetching(&self) -> bool {
        self.query.state().is_refetching.get()
    }

    /// Whether a first fetch is running.
    pub fn is_first_fetching(&self) -> bool {
        self.query.state().is_first_fetching.get()
    }

    /// Whether any fetch is running.
    pub fn is_fetching(&self) -> bool {
        self.query.state().is_fetching()
    }

    /// Project the current data.
    pub fn select<T>(&self, f: impl FnOnce(Option<&D>) -> T) -> T {
        self.query.state().data.with(|data| f(data.as_ref()))
    }

    /// Subscribe to data changes.
    pub fn watch_data(&self) -> watch::Receiver<Option<D>> {
        self.query.state().data.subscribe()
    }

    /// End the subscription. Same as dropping it.
    pub fn dispose(self) {}
}

impl<D: Clone, P> QuerySubscription<D, P> {
    /// The current data.
    pub fn data(&self) -> Option<D> {
        self.query.data()
    }
}

impl<D, P> Drop for QuerySubscription<D, P> {
    fn drop(&mut self) {
        self.stop.cancel();
        self.query.cancel();
    }
}
