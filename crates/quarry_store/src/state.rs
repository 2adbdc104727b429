// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key query state and staleness rules.

use std::{
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tick::Clock;

use crate::QueryError;

/// The `updated_at` value that marks an entry as invalidated.
///
/// An invalidated entry is stale under every stale time.
pub const INVALIDATED: u64 = 0;

/// The cached state of a single query.
///
/// `updated_at` is wall-clock milliseconds since the Unix epoch of the last successful or
/// failed fetch, or [`INVALIDATED`]. Errors are never serialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    /// The last fetched payload, if any.
    #[serde(default)]
    pub data: Option<Arc<Value>>,
    /// The error of the last fetch, if it failed.
    #[serde(skip)]
    pub error: Option<Arc<QueryError>>,
    /// `true` while no payload or error has been produced yet.
    #[serde(default)]
    pub is_loading: bool,
    /// `true` while a fetch for this key is in flight.
    #[serde(default)]
    pub is_fetching: bool,
    /// Milliseconds since the Unix epoch of the last write, or [`INVALIDATED`].
    #[serde(default)]
    pub updated_at: u64,
}

impl QueryState {
    /// A successful state holding `data`.
    #[must_use]
    pub fn success(data: Arc<Value>, updated_at: u64) -> Self {
        Self {
            data: Some(data),
            error: None,
            is_loading: false,
            is_fetching: false,
            updated_at,
        }
    }

    /// A failed state holding `error` and no payload.
    #[must_use]
    pub fn failure(error: Arc<QueryError>, updated_at: u64) -> Self {
        Self {
            data: None,
            error: Some(error),
            is_loading: false,
            is_fetching: false,
            updated_at,
        }
    }

    /// Returns `true` if the entry has been invalidated.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.updated_at == INVALIDATED
    }

    /// Returns `true` if the entry is stale at `now` under `stale_time`.
    ///
    /// See [`is_stale`].
    #[must_use]
    pub fn is_stale(&self, now: u64, stale_time: Duration) -> bool {
        is_stale(self.updated_at, now, stale_time)
    }
}

impl PartialEq for QueryState {
    fn eq(&self, other: &Self) -> bool {
        let same_error = match (&self.error, &other.error) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };

        same_error
            && self.data == other.data
            && self.is_loading == other.is_loading
            && self.is_fetching == other.is_fetching
            && self.updated_at == other.updated_at
    }
}

/// Decides whether an entry written at `updated_at` is stale at `now`.
///
/// An entry is stale when it was invalidated, or when at least `stale_time` has elapsed
/// since it was written. A zero stale time makes every entry stale immediately, and
/// [`Duration::MAX`] keeps entries fresh until invalidated.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use quarry_store::{INVALIDATED, is_stale};
///
/// assert!(is_stale(INVALIDATED, 5_000, Duration::MAX));
/// assert!(!is_stale(1_000, 1_500, Duration::from_secs(1)));
/// assert!(is_stale(1_000, 2_000, Duration::from_secs(1)));
/// ```
#[must_use]
pub fn is_stale(updated_at: u64, now: u64, stale_time: Duration) -> bool {
    if updated_at == INVALIDATED {
        return true;
    }

    u128::from(now.saturating_sub(updated_at)) >= stale_time.as_millis()
}

/// Reads the clock's wall time as milliseconds since the Unix epoch.
///
/// The result is never [`INVALIDATED`], so a write at the epoch is not mistaken for an
/// invalidation.
#[must_use]
pub fn now_millis(clock: &Clock) -> u64 {
    clock
        .system_time()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .max(1)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn zero_stale_time_is_always_stale() {
        assert!(is_stale(10, 10, Duration::ZERO));
    }

    #[test]
    fn max_stale_time_is_fresh_until_invalidated() {
        assert!(!is_stale(10, u64::MAX, Duration::MAX));
        assert!(is_stale(INVALIDATED, 10, Duration::MAX));
    }

    #[test]
    fn staleness_is_monotonic_in_time() {
        let stale_time = Duration::from_millis(100);
        let mut was_stale = false;

        for now in (1_000..1_300).step_by(7) {
            let stale = is_stale(1_000, now, stale_time);
            assert!(!was_stale || stale, "became fresh again at {now}");
            was_stale = stale;
        }

        assert!(was_stale);
    }

    #[test]
    fn clock_before_write_is_not_stale() {
        assert!(!is_stale(2_000, 1_000, Duration::from_millis(1)));
    }

    #[test]
    fn now_millis_never_returns_sentinel() {
        let control = tick::ClockControl::new();
        assert_eq!(now_millis(&control.to_clock()), 1);

        control.advance(Duration::from_secs(2));
        assert_eq!(now_millis(&control.to_clock()), 2_000);
    }

    #[test]
    fn success_and_failure_constructors() {
        let ok = QueryState::success(Arc::new(json!({ "id": 1 })), 5);
        assert_eq!(ok.data.as_deref(), Some(&json!({ "id": 1 })));
        assert!(ok.error.is_none());
        assert!(!ok.is_loading);

        let failed = QueryState::failure(Arc::new(QueryError::fetch("boom")), 6);
        assert!(failed.data.is_none());
        assert!(failed.error.is_some());
        assert_eq!(failed.updated_at, 6);
    }

    #[test]
    fn equality_compares_errors_by_identity() {
        let error = Arc::new(QueryError::fetch("boom"));
        let a = QueryState::failure(Arc::clone(&error), 1);
        let b = QueryState::failure(error, 1);
        let c = QueryState::failure(Arc::new(QueryError::fetch("boom")), 1);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn serializes_camel_case_without_error() {
        let mut state = QueryState::failure(Arc::new(QueryError::fetch("boom")), 9);
        state.data = Some(Arc::new(json!([1, 2])));

        let encoded = serde_json::to_value(&state).expect("state should serialize");
        assert_eq!(
            encoded,
            json!({ "data": [1, 2], "isLoading": false, "isFetching": false, "updatedAt": 9 })
        );
    }
}
