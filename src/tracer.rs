//! Tracer trait for observing fetches and mutations.
//!
//! The default [`NoopTracer`] ignores every event. Install a custom tracer
//! with [`QueryClientBuilder::tracer`](crate::QueryClientBuilder::tracer) to
//! collect events in tests or forward them to a metrics pipeline.
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{FetchOutcome, QueryClient, Tracer, TracerQueryKey};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_fetch_end(&self, query: &TracerQueryKey, outcome: &FetchOutcome) {
//!         println!("{} -> {:?}", query.hash, outcome);
//!     }
//! }
//!
//! let client = QueryClient::builder().tracer(PrintTracer).build()?;
//! ```

use crate::key::QueryHash;

/// Represents a query in a type-erased manner for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TracerQueryKey {
    /// The id of the query key.
    pub id: String,
    /// Canonical hash of the query key.
    pub hash: QueryHash,
}

impl TracerQueryKey {
    /// Create a new tracer query key.
    #[inline]
    pub fn new(id: impl Into<String>, hash: QueryHash) -> Self {
        Self {
            id: id.into(),
            hash,
        }
    }
}

/// How a fetch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The fetcher returned data.
    Success,
    /// The fetcher failed.
    Error { message: String },
    /// The fetch was cancelled before it finished.
    Cancelled,
}

/// How a mutation invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The mutator returned data.
    Success,
    /// The mutator failed.
    Error { message: String },
    /// The invocation was cancelled before it finished.
    Cancelled,
}

/// Tracer trait for observing query and mutation execution.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: events are emitted from tasks
/// running on the client's runtime, concurrently.
pub trait Tracer: Send + Sync + 'static {
    /// Called when the client creates a new query instance.
    #[inline]
    fn on_query_created(&self, _query: &TracerQueryKey) {}

    /// Called before each call to the fetcher. `attempt` starts at 0.
    #[inline]
    fn on_fetch_attempt(&self, _query: &TracerQueryKey, _attempt: u32) {}

    /// Called once per fetch task, after the last attempt.
    #[inline]
    fn on_fetch_end(&self, _query: &TracerQueryKey, _outcome: &FetchOutcome) {}

    /// Called when the client creates a new mutation.
    #[inline]
    fn on_mutation_created(&self, _id: &str) {}

    /// Called before a mutation instance calls its mutator.
    #[inline]
    fn on_mutation_start(&self, _id: &str) {}

    /// Called when a mutation invocation settles.
    #[inline]
    fn on_mutation_end(&self, _id: &str, _outcome: &MutationOutcome) {}
}

/// Zero-cost tracer that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}
