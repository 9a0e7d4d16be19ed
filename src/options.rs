//! Fetch policy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client-wide fetch policy, used wherever a subscription leaves a field unset.
///
/// Can be deserialized from configuration; `stale_time` takes a humantime
/// string such as `"30s"` or `"5m"`:
///
/// ```ignore
/// let defaults: QueryDefaults = serde_json::from_str(r#"{"stale_time": "30s", "retries": 2}"#)?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryDefaults {
    /// How long fetched data stays fresh. `Duration::MAX` never expires.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,
    /// Whether subscriptions fetch automatically.
    pub enabled: bool,
    /// Extra fetch attempts after a failure.
    pub retries: u32,
}

impl QueryDefaults {
    /// Default stale time: five minutes.
    pub const STALE_TIME: Duration = Duration::from_secs(5 * 60);
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            stale_time: Self::STALE_TIME,
            enabled: true,
            retries: 0,
        }
    }
}

/// Per-subscription overrides of [`QueryDefaults`].
///
/// # Example
///
/// ```ignore
/// let sub = query.subscribe(QueryOptions::new().stale_time(Duration::ZERO).retries(3));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Overrides [`QueryDefaults::stale_time`].
    pub stale_time: Option<Duration>,
    /// Overrides [`QueryDefaults::enabled`].
    pub enabled: Option<bool>,
    /// Overrides [`QueryDefaults::retries`].
    pub retries: Option<u32>,
}

impl QueryOptions {
    /// Options that defer everything to the client defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stale time.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Enable or disable automatic fetching.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the retry count.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Fill unset fields from `defaults`.
    pub fn resolve(&self, defaults: &QueryDefaults) -> QueryDefaults {
        QueryDefaults {
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            enabled: self.enabled.unwrap_or(defaults.enabled),
            retries: self.retries.unwrap_or(defaults.retries),
        }
    }
}
