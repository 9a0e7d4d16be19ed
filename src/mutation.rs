//! Mutations: id-keyed asynchronous writes and their instances.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;

use crate::cell::{Activity, StateCell};
use crate::client::ClientShared;
use crate::state::set_outcome;
use crate::task::{settle, Settled, TaskSlot};
use crate::tracer::MutationOutcome;
use crate::QueryCacheError;

/// Performs the write behind a mutation.
///
/// Implemented for any `Fn(P) -> impl Future<Output = anyhow::Result<D>>`.
/// A call is cancelled by dropping its future at an `.await` point.
#[async_trait]
pub trait Mutator<D, P>: Send + Sync + 'static {
    /// Perform the write for `params`.
    async fn mutate(&self, params: P) -> anyhow::Result<D>;
}

#[async_trait]
impl<D, P, F, Fut> Mutator<D, P> for F
where
    D: Send + 'static,
    P: Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<D>> + Send,
{
    async fn mutate(&self, params: P) -> anyhow::Result<D> {
        (self)(params).await
    }
}

/// An id-keyed asynchronous write.
///
/// Created through [`QueryClient::create_mutation`](crate::QueryClient::create_mutation).
/// Use [`Mutation::subscribe`] to get an instance with its own state, or
/// [`Mutation::mutate`] for a one-shot call. Cheap to clone.
pub struct Mutation<D, P> {
    inner: Arc<MutationInner<D, P>>,
}

struct MutationInner<D, P> {
    id: String,
    mutator: Arc<dyn Mutator<D, P>>,
    activity: Arc<Activity>,
    shared: Arc<ClientShared>,
}

impl<D, P> Clone for Mutation<D, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D, P> Mutation<D, P> {
    pub(crate) fn new(
        id: String,
        mutator: Arc<dyn Mutator<D, P>>,
        shared: Arc<ClientShared>,
    ) -> Self {
        Self {
            inner: Arc::new(MutationInner {
                id,
                mutator,
                activity: Arc::new(Activity::with_parent(shared.mutating.clone())),
                shared,
            }),
        }
    }

    /// The id this mutation was created with.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether any instance of this mutation is running.
    pub fn is_mutating(&self) -> bool {
        self.inner.activity.is_active()
    }

    /// Subscribe to [`is_mutating`](Mutation::is_mutating).
    pub fn watch_mutating(&self) -> watch::Receiver<bool> {
        self.inner.activity.subscribe()
    }

    /// Returns `true` if both handles point to the same mutation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<D, P> Mutation<D, P>
where
    D: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Call the mutator once, without any state tracking.
    pub async fn mutate(&self, params: P) -> Result<D, QueryCacheError> {
        self.inner
            .mutator
            .mutate(params)
            .await
            .map_err(QueryCacheError::from_callback)
    }

    /// Create an instance with its own state and the given hooks.
    pub fn subscribe(&self, hooks: MutationHooks<D, P>) -> MutationInstance<D, P> {
        MutationInstance {
            inner: Arc::new(InstanceInner {
                mutation: self.clone(),
                hooks,
                state: MutationState::default(),
                task: TaskSlot::new(),
            }),
        }
    }
}

type Hook<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

fn hook<T, F, Fut>(f: F) -> Hook<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |value| f(value).boxed())
}

/// Lifecycle hooks of a [`MutationInstance`].
///
/// Every hook runs as its own task; the instance never waits for one.
/// `on_mutate` is scheduled before the mutator starts. Exactly one of
/// `on_success`, `on_error` and `on_cancel` is scheduled once it settles,
/// followed by `on_settled`.
///
/// # Example
///
/// ```ignore
/// let save = client.create_mutation("save", |todo: Todo| api::save(todo))?;
/// let instance = save.subscribe(
///     MutationHooks::new()
///         .on_success(move |_saved| {
///             let todos = todos.clone();
///             async move { todos.invalidate() }
///         })
///         .on_error(|error| async move { tracing::warn!(%error, "save failed") }),
/// );
/// ```
pub struct MutationHooks<D, P> {
    on_mutate: Option<Hook<P>>,
    on_success: Option<Hook<D>>,
    on_error: Option<Hook<Arc<anyhow::Error>>>,
    on_cancel: Option<Hook<QueryCacheError>>,
    on_settled: Option<Hook<()>>,
}

impl<D, P> Default for MutationHooks<D, P> {
    fn default() -> Self {
        Self {
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_cancel: None,
            on_settled: None,
        }
    }
}

impl<D, P> MutationHooks<D, P> {
    /// No hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run with the params of each call, before the mutator starts.
    pub fn on_mutate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_mutate = Some(hook(f));
        self
    }

    /// Run with the returned data after a successful call.
    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(D) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_success = Some(hook(f));
        self
    }

    /// Run with the failure after a failed call.
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<anyhow::Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(hook(f));
        self
    }

    /// Run after a cancelled call, with [`QueryCacheError::Cancelled`].
    pub fn on_cancel<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryCacheError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_cancel = Some(hook(f));
        self
    }

    /// Run after every call, whatever the outcome.
    pub fn on_settled<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_settled = Some(hook(move |()| f()));
        self
    }
}

/// Observable state of a [`MutationInstance`].
#[derive(Debug)]
pub struct MutationState<D> {
    /// Data of the last successful call.
    pub data: StateCell<Option<D>>,
    /// Failure of the last failed call.
    pub error: StateCell<Option<Arc<anyhow::Error>>>,
    /// A call is running.
    pub is_mutating: StateCell<bool>,
    /// The last settled call failed.
    pub is_error: StateCell<bool>,
    /// The last settled call succeeded.
    pub is_success: StateCell<bool>,
}

impl<D> MutationState<D> {
    /// Same write order as [`QueryState`](crate::QueryState): the flag being
    /// cleared goes first.
    fn set_outcome(&self, success: bool) {
        set_outcome(&self.is_success, &self.is_error, success);
    }
}

impl<D> Default for MutationState<D> {
    fn default() -> Self {
        Self {
            data: StateCell::new(None),
            error: StateCell::new(None),
            is_mutating: StateCell::new(false),
            is_error: StateCell::new(false),
            is_success: StateCell::new(false),
        }
    }
}

/// One use site of a [`Mutation`], with its own state.
///
/// Calls are last-wins: [`mutate`](MutationInstance::mutate) cancels the
/// call still running on this instance. Dropping the instance cancels its
/// running call.
pub struct MutationInstance<D, P> {
    inner: Arc<InstanceInner<D, P>>,
}

struct InstanceInner<D, P> {
    mutation: Mutation<D, P>,
    hooks: MutationHooks<D, P>,
    state: MutationState<D>,
    task: TaskSlot,
}

impl<D, P> MutationInstance<D, P> {
    /// The mutation this instance belongs to.
    pub fn mutation(&self) -> &Mutation<D, P> {
        &self.inner.mutation
    }

    /// The observable state.
    pub fn state(&self) -> &MutationState<D> {
        &self.inner.state
    }

    /// The failure of the last failed call.
    pub fn error(&self) -> Option<Arc<anyhow::Error>> {
        self.inner.state.error.get()
    }

    /// Whether a call is running.
    pub fn is_mutating(&self) -> bool {
        self.inner.state.is_mutating.get()
    }

    /// Whether the last settled call succeeded.
    pub fn is_success(&self) -> bool {
        self.inner.state.is_success.get()
    }

    /// Whether the last settled call failed.
    pub fn is_error(&self) -> bool {
        self.inner.state.is_error.get()
    }

    /// Cancel the running call. No-op if idle.
    pub fn cancel(&self) {
        self.inner.task.cancel();
    }

    /// Wait for the running call, if any, to settle.
    pub async fn settled(&self) {
        self.inner.task.settled().await;
    }

    /// Cancel the running call and drop the instance.
    pub fn dispose(self) {}
}

impl<D: Clone, P> MutationInstance<D, P> {
    /// The data of the last successful call.
    pub fn data(&self) -> Option<D> {
        self.inner.state.data.get()
    }
}

impl<D, P> MutationInstance<D, P>
where
    D: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Start a call in the background, cancelling the running one.
    pub fn mutate(&self, params: P) {
        let inner = self.inner.clone();
        let _ = self.inner.task.replace(
            &self.inner.mutation.inner.shared.runtime,
            move |token| async move {
                inner.run(params, &token).await;
            },
        );
    }
}

impl<D, P> InstanceInner<D, P>
where
    D: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn spawn_hook<T: Send + 'static>(&self, hook: &Option<Hook<T>>, value: T) {
        if let Some(hook) = hook {
            self.mutation.inner.shared.runtime.spawn(hook(value));
        }
    }

    async fn run(&self, params: P, token: &tokio_util::sync::CancellationToken) {
        let mutation = &self.mutation.inner;
        let state = &self.state;
        let active = mutation.activity.track();
        state.is_mutating.set_if_changed(true);
        mutation.shared.tracer.on_mutation_start(&mutation.id);

        self.spawn_hook(&self.hooks.on_mutate, params.clone());
        let outcome = match settle(token, mutation.mutator.mutate(params)).await {
            Settled::Done(data) => {
                state.data.set(Some(data.clone()));
                state.error.set(None);
                state.set_outcome(true);
                self.spawn_hook(&self.hooks.on_success, data);
                MutationOutcome::Success
            }
            Settled::Failed(error) => {
                tracing::error!(mutation = %mutation.id, error = %error, "mutation failed");
                let message = error.to_string();
                state.error.set(Some(error.clone()));
                state.set_outcome(false);
                self.spawn_hook(&self.hooks.on_error, error);
                MutationOutcome::Error { message }
            }
            Settled::Cancelled => {
                tracing::debug!(mutation = %mutation.id, "mutation cancelled");
                self.spawn_hook(&self.hooks.on_cancel, QueryCacheError::Cancelled);
                MutationOutcome::Cancelled
            }
        };
        self.spawn_hook(&self.hooks.on_settled, ());

        state.is_mutating.set_if_changed(false);
        drop(active);
        mutation.shared.tracer.on_mutation_end(&mutation.id, &outcome);
    }
}

impl<D, P> Drop for MutationInstance<D, P> {
    fn drop(&mut self) {
        self.inner.task.cancel();
    }
}
