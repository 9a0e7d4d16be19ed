//! Query-Cache: an asynchronous, keyed data cache for reads and writes.
//!
//! Queries are cached, keyed reads with observable lifecycle state.
//! Mutations are id-keyed writes, used through instances that carry their
//! own state and lifecycle hooks. Both live in a [`QueryClient`], which is
//! constructed explicitly and passed to whoever needs it.
//!
//! # Key Features
//!
//! - **Idempotent registry**: equal keys always yield the same [`Query`]
//! - **Observable state**: every state field is a [`StateCell`] with
//!   "current value" and "subscribe to changes"
//! - **Last-writer-wins tasks**: a new fetch or mutation call cancels the
//!   running one; cancellation is never recorded as an error
//! - **Staleness**: a pure function of state and options, driving
//!   [`QuerySubscription`]s
//! - **Persistence**: query snapshots mirrored to a pluggable [`Persister`]
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{QueryClient, QueryKey, QueryOptions};
//!
//! let client = QueryClient::new()?;
//! let user = client.create_query(QueryKey::new("user", 42u64), |id: u64| async move {
//!     api::get_user(id).await
//! })?;
//!
//! let sub = user.subscribe(QueryOptions::new());
//! let name = sub.select(|user| user.map(|u| u.name.clone()));
//! ```
//!
//! All tasks run on a tokio runtime: the current one when the client is
//! built, or the one given to [`QueryClientBuilder::runtime`].

#![warn(missing_docs)]

mod cell;
mod client;
mod error;
mod key;
mod mutation;
mod options;
mod persist;
mod query;
mod state;
mod task;
pub mod tracer;

pub use cell::StateCell;
pub use client::{QueryClient, QueryClientBuilder, QueryFamily};
pub use error::QueryCacheError;
pub use key::{QueryHash, QueryKey};
pub use mutation::{Mutation, MutationHooks, MutationInstance, MutationState, Mutator};
pub use options::{QueryDefaults, QueryOptions};
pub use persist::{MemoryPersister, Persister, Snapshot};
pub use query::{Fetcher, Query, QueryData, QueryParams, QuerySubscription};
pub use state::{is_stale, now, QueryState, Timestamp};
pub use tracer::{FetchOutcome, MutationOutcome, NoopTracer, Tracer, TracerQueryKey};
