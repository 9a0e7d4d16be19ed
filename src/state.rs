//! Observable state of a query.

use std::sync::Arc;
use std::time::Duration;

use crate::cell::StateCell;

/// Seconds since the Unix epoch, the unit of every `updated_at` field.
pub type Timestamp = i64;

/// Current time in epoch seconds.
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// The lifecycle fields of one query.
///
/// Every field is an independent [`StateCell`]: it can be read at any time
/// and subscribed to on its own. `is_error` and `is_success` are never both
/// `true`, and `data` is cleared whenever `error` is set.
#[derive(Debug)]
pub struct QueryState<D> {
    /// Data from the last successful fetch, or the restored snapshot.
    pub data: StateCell<Option<D>>,
    /// The failure of the last fetch, cleared on success.
    pub error: StateCell<Option<Arc<anyhow::Error>>>,
    /// Time of the last successful fetch.
    pub updated_at: StateCell<Timestamp>,
    /// A fetch has succeeded at least once.
    pub is_first_fetched: StateCell<bool>,
    /// A fetch is running and none has succeeded yet.
    pub is_first_fetching: StateCell<bool>,
    /// A fetch is running after at least one success.
    pub is_refetching: StateCell<bool>,
    /// The last fetch failed.
    pub is_error: StateCell<bool>,
    /// The last fetch succeeded.
    pub is_success: StateCell<bool>,
    /// The data was explicitly marked as outdated.
    pub invalidated: StateCell<bool>,
}

impl<D> QueryState<D> {
    /// State seeded with previously known data, e.g. from a persisted snapshot.
    pub fn new(data: Option<D>, updated_at: Timestamp) -> Self {
        Self {
            data: StateCell::new(data),
            error: StateCell::new(None),
            updated_at: StateCell::new(updated_at),
            is_first_fetched: StateCell::new(false),
            is_first_fetching: StateCell::new(false),
            is_refetching: StateCell::new(false),
            is_error: StateCell::new(false),
            is_success: StateCell::new(false),
            invalidated: StateCell::new(false),
        }
    }

    /// `true` while either a first fetch or a refetch is running.
    pub fn is_fetching(&self) -> bool {
        self.is_first_fetching.get() || self.is_refetching.get()
    }

    /// Record the outcome of a settled fetch in `is_success` / `is_error`.
    ///
    /// The flag being cleared is written first, so a concurrent reader never
    /// sees both set.
    pub(crate) fn set_outcome(&self, success: bool) {
        set_outcome(&self.is_success, &self.is_error, success);
    }

    /// The loading flag a fetch started now should raise.
    pub(crate) fn loading_flag(&self) -> &StateCell<bool> {
        if self.is_first_fetched.get() {
            &self.is_refetching
        } else {
            &self.is_first_fetching
        }
    }

    /// Whether the data is stale at time `now`.
    ///
    /// Stale iff never fetched successfully, invalidated, or at least
    /// `stale_time` has elapsed since `updated_at`. Sub-second stale times
    /// round up to whole seconds. `Duration::MAX` means the
    /// data never goes stale by age alone.
    pub fn is_stale_at(&self, stale_time: Duration, now: Timestamp) -> bool {
        is_stale(
            self.is_first_fetched.get(),
            self.invalidated.get(),
            self.updated_at.get(),
            stale_time,
            now,
        )
    }
}

impl<D> Default for QueryState<D> {
    fn default() -> Self {
        Self::new(None, 0)
    }
}

pub(crate) fn set_outcome(is_success: &StateCell<bool>, is_error: &StateCell<bool>, success: bool) {
    if success {
        is_error.set_if_changed(false);
        is_success.set_if_changed(true);
    } else {
        is_success.set_if_changed(false);
        is_error.set_if_changed(true);
    }
}

/// The staleness rule on plain values.
pub fn is_stale(
    is_first_fetched: bool,
    invalidated: bool,
    updated_at: Timestamp,
    stale_time: Duration,
    now: Timestamp,
) -> bool {
    if !is_first_fetched || invalidated {
        return true;
    }
    let elapsed = u64::try_from(now.saturating_sub(updated_at)).unwrap_or(0);
    elapsed >= stale_secs(stale_time)
}

/// `stale_time` in whole seconds, rounded up to the clock resolution.
fn stale_secs(stale_time: Duration) -> u64 {
    let secs = stale_time.as_secs();
    if stale_time.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Whether data is stale as soon as it arrives under `stale_time`.
pub(crate) fn expires_immediately(stale_time: Duration) -> bool {
    stale_secs(stale_time) == 0
}
