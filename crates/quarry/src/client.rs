// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The process-wide query client.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
    time::Duration,
};

use anyspawn::Spawner;
use futures::{StreamExt, channel::mpsc};
use parking_lot::Mutex;
use serde_json::Value;
use tick::Clock;
use tokio_util::sync::CancellationToken;

use crate::{
    CanonicalKey, INVALIDATED, KeyPrefix, QueryError, QueryState, QueryStore, Snapshot,
    builder::QueryClientBuilder,
    coordinator::{FetchHooks, FetchOutcome},
    fetch::Fetcher,
    now_millis,
    options::{QueryOptions, QuerySource},
    telemetry::{QueryActivity, QueryOperation, QueryTelemetry},
};

/// Type alias for client names used in telemetry.
pub type ClientName = &'static str;

/// Owns a query cache and the fetcher that fills it.
///
/// The client is the imperative surface of the cache: it reads and writes entries,
/// invalidates them by prefix, fetches outside of any observer and moves the cache
/// across process boundaries with [`dehydrate`](Self::dehydrate) and
/// [`hydrate`](Self::hydrate). [`QueryObserver`](crate::QueryObserver)s are created against
/// a client and share its cache.
///
/// Cloning is cheap; every clone refers to the same cache.
///
/// # Examples
///
/// ```
/// use anyspawn::Spawner;
/// use quarry::{QueryClient, QueryOptions, query_key};
/// use serde_json::json;
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = QueryClient::builder(Clock::new_tokio(), Spawner::new_tokio()).build();
///
/// let options = QueryOptions::builder(query_key!["greeting"])
///     .query_fn(|_| async { Ok(json!("hello")) })
///     .build()
///     .unwrap();
///
/// let data = client.fetch_query(&options).await.unwrap();
/// assert_eq!(*data, json!("hello"));
/// assert_eq!(client.get_query_data(query_key!["greeting"]).as_deref(), Some(&json!("hello")));
/// # }
/// ```
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) name: ClientName,
    pub(crate) store: QueryStore,
    pub(crate) fetcher: Option<Arc<dyn Fetcher>>,
    pub(crate) default_stale_time: Duration,
    pub(crate) default_gc_time: Duration,
    pub(crate) stampede_protection: bool,
    pub(crate) in_flight: Mutex<HashMap<CanonicalKey, usize>>,
    pub(crate) telemetry: QueryTelemetry,
    pub(crate) cancellation: Mutex<CancellationToken>,
}

impl QueryClient {
    /// Starts building a client that reads time from `clock` and runs background work on
    /// `spawner`.
    pub fn builder(clock: Clock, spawner: Spawner) -> QueryClientBuilder {
        QueryClientBuilder::new(clock, spawner)
    }

    pub(crate) fn from_inner(inner: ClientInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    /// Returns the name of this client for telemetry identification.
    #[must_use]
    pub fn name(&self) -> ClientName {
        self.inner.name
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &QueryStore {
        &self.inner.store
    }

    /// Returns the client's clock.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        self.inner.store.clock()
    }

    /// Returns the client's spawner.
    #[must_use]
    pub fn spawner(&self) -> &Spawner {
        self.inner.store.spawner()
    }

    /// Returns the stale time used by options that do not set one.
    #[must_use]
    pub fn default_stale_time(&self) -> Duration {
        self.inner.default_stale_time
    }

    /// Returns the eviction grace period used by options that do not set one.
    #[must_use]
    pub fn default_gc_time(&self) -> Duration {
        self.inner.default_gc_time
    }

    /// Returns the cached data for `key`.
    #[must_use]
    pub fn get_query_data(&self, key: impl Into<CanonicalKey>) -> Option<Arc<Value>> {
        self.inner.store.get(&key.into())?.data
    }

    /// Returns the full cached state for `key`.
    #[must_use]
    pub fn get_query_state(&self, key: impl Into<CanonicalKey>) -> Option<QueryState> {
        self.inner.store.get(&key.into())
    }

    /// Writes `data` for `key` as if it had just been fetched.
    ///
    /// A fetch already in flight for the key keeps its `is_fetching` flag.
    pub fn set_query_data(&self, key: impl Into<CanonicalKey>, data: Value) {
        let key = key.into();
        let mut state = QueryState::success(Arc::new(data), self.now());
        state.is_fetching = self.inner.store.get(&key).is_some_and(|previous| previous.is_fetching);

        self.inner.store.set(key.clone(), state);
        self.inner.store.notify(&key);
    }

    /// Replaces the cached state for `key`.
    pub fn set_query_state(&self, key: impl Into<CanonicalKey>, state: QueryState) {
        let key = key.into();
        self.inner.store.set(key.clone(), state);
        self.inner.store.notify(&key);
    }

    /// Marks every entry matching `prefix` as stale without removing it.
    ///
    /// Matching entries keep their data, so observers keep showing it while active
    /// observers refresh in the background. Returns the number of entries invalidated.
    ///
    /// # Examples
    ///
    /// ```
    /// use anyspawn::Spawner;
    /// use quarry::{INVALIDATED, QueryClient, query_key};
    /// use serde_json::json;
    /// use tick::Clock;
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let client = QueryClient::builder(Clock::new_tokio(), Spawner::new_tokio()).build();
    /// client.set_query_data(query_key!["user", 1], json!({ "id": 1 }));
    /// client.set_query_data(query_key!["post", 1], json!({ "id": 1 }));
    ///
    /// assert_eq!(client.invalidate_queries(query_key!["user"]), 1);
    /// let user = client.get_query_state(query_key!["user", 1]).unwrap();
    /// assert_eq!(user.updated_at, INVALIDATED);
    /// assert!(user.data.is_some());
    /// # }
    /// ```
    pub fn invalidate_queries(&self, prefix: impl Into<KeyPrefix>) -> usize {
        let prefix = prefix.into();
        let mut invalidated = 0;

        for key in self.inner.store.keys().into_iter().filter(|key| prefix.matches(key)) {
            if self.inner.store.update(&key, |state| state.updated_at = INVALIDATED) {
                invalidated += 1;
                self.record(QueryOperation::Invalidate, QueryActivity::Invalidated, Some(&key), None);
                self.inner.store.notify(&key);
            }
        }

        invalidated
    }

    /// Removes every entry matching `prefix`, returning the number removed.
    ///
    /// Subscriber counts are kept, so observers of removed keys show the loading state
    /// until their next fetch.
    pub fn remove_queries(&self, prefix: impl Into<KeyPrefix>) -> usize {
        let prefix = prefix.into();
        let mut removed = 0;

        for key in self.inner.store.keys().into_iter().filter(|key| prefix.matches(key)) {
            if self.inner.store.delete(&key).is_some() {
                removed += 1;
                self.record(QueryOperation::Remove, QueryActivity::Removed, Some(&key), None);
                self.inner.store.notify(&key);
            }
        }

        self.record_size();
        removed
    }

    /// Removes every entry and cancels every pending eviction.
    pub fn clear(&self) {
        let keys = self.inner.store.clear();

        self.record(QueryOperation::Clear, QueryActivity::Cleared, None, None);
        self.record_size();

        for key in &keys {
            self.inner.store.notify(key);
        }
    }

    /// Fetches `options` unless fresh data is cached, then returns the cached outcome.
    ///
    /// This ignores [`enabled`](crate::QueryOptionsBuilder::enabled): an imperative fetch
    /// is always allowed. With stampede protection enabled, a call that finds a fetch for
    /// the same key in flight waits for it instead of starting another.
    ///
    /// # Errors
    ///
    /// Returns the error stored for the key if the fetch failed, or a configuration error
    /// if the options cannot be fetched by this client.
    pub async fn fetch_query(&self, options: &QueryOptions) -> Result<Arc<Value>, Arc<QueryError>> {
        self.check_options(options).map_err(Arc::new)?;

        match self.fetch_if_stale(options, &FetchHooks::default()).await {
            FetchOutcome::Settled(outcome) => outcome,
            FetchOutcome::Deduplicated => {
                self.wait_for_fetch(options.canonical_key()).await;
                self.settled_outcome(options.canonical_key())
            }
            FetchOutcome::Cancelled => Err(Arc::new(QueryError::fetch("fetch was cancelled"))),
            FetchOutcome::Disabled | FetchOutcome::Fresh => self.settled_outcome(options.canonical_key()),
        }
    }

    /// Like [`fetch_query`](Self::fetch_query), but only warms the cache.
    ///
    /// Failures are stored in the cache as usual and otherwise ignored.
    pub async fn prefetch_query(&self, options: &QueryOptions) {
        if let Err(error) = self.fetch_query(options).await {
            tracing::debug!(query.key = options.canonical_key().as_str(), error = %error, "query.prefetch_failed");
        }
    }

    /// Returns the number of keys with a fetch in flight.
    #[must_use]
    pub fn is_fetching(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Exports every successfully fetched entry.
    #[must_use]
    pub fn dehydrate(&self) -> Snapshot {
        let snapshot = self.inner.store.serialize();
        self.record(QueryOperation::Dehydrate, QueryActivity::Dehydrated, None, None);
        snapshot
    }

    /// Merges a snapshot produced by [`dehydrate`](Self::dehydrate) into this client's
    /// cache, returning the number of entries written.
    pub fn hydrate(&self, snapshot: Snapshot) -> usize {
        let written = self.inner.store.deserialize(snapshot);
        self.record(QueryOperation::Hydrate, QueryActivity::Hydrated, None, None);
        self.record_size();
        written
    }

    /// Signals cancellation to every fetch started so far.
    ///
    /// Fetches started afterwards get a fresh token. A cancelled fetch writes nothing to
    /// the cache.
    pub fn cancel_all(&self) {
        let previous = std::mem::replace(&mut *self.inner.cancellation.lock(), CancellationToken::new());
        previous.cancel();
    }

    /// Rejects options this client cannot fetch.
    pub(crate) fn check_options(&self, options: &QueryOptions) -> Result<(), QueryError> {
        if self.inner.fetcher.is_none() && !matches!(options.source, QuerySource::Function(_)) {
            return Err(QueryError::configuration(format!(
                "query {} fetches a url but client '{}' has no fetcher",
                options.key(),
                self.inner.name
            )));
        }

        Ok(())
    }

    pub(crate) fn fetcher(&self) -> Option<&Arc<dyn Fetcher>> {
        self.inner.fetcher.as_ref()
    }

    pub(crate) fn stale_time_for(&self, options: &QueryOptions) -> Duration {
        options.stale_time().unwrap_or(self.inner.default_stale_time)
    }

    pub(crate) fn gc_time_for(&self, options: &QueryOptions) -> Duration {
        options.gc_time().unwrap_or(self.inner.default_gc_time)
    }

    pub(crate) fn now(&self) -> u64 {
        now_millis(self.clock())
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.lock().child_token()
    }

    /// Registers a fetch for `key`, returning `false` if it must be skipped because
    /// another fetch for the key is in flight.
    pub(crate) fn begin_fetch(&self, key: &CanonicalKey) -> bool {
        let mut in_flight = self.inner.in_flight.lock();
        let count = in_flight.entry(key.clone()).or_insert(0);

        if self.inner.stampede_protection && *count > 0 {
            return false;
        }

        *count += 1;
        true
    }

    pub(crate) fn end_fetch(&self, key: &CanonicalKey) {
        let mut in_flight = self.inner.in_flight.lock();

        if let Some(count) = in_flight.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                in_flight.remove(key);
            }
        }
    }

    pub(crate) fn is_key_in_flight(&self, key: &CanonicalKey) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    pub(crate) fn record(&self, operation: QueryOperation, activity: QueryActivity, key: Option<&CanonicalKey>, duration: Option<Duration>) {
        self.inner.telemetry.record(self.inner.name, operation, activity, key, duration);
    }

    pub(crate) fn record_size(&self) {
        self.inner.telemetry.record_size(self.inner.name, self.inner.store.len());
    }

    async fn wait_for_fetch(&self, key: &CanonicalKey) {
        let (sender, mut receiver) = mpsc::unbounded();
        let _listener = self.inner.store.listen(key.clone(), move |_| {
            // The receiver only goes away once the wait is over.
            let _ = sender.unbounded_send(());
        });

        while self.is_key_in_flight(key) {
            if receiver.next().await.is_none() {
                break;
            }
        }
    }

    fn settled_outcome(&self, key: &CanonicalKey) -> Result<Arc<Value>, Arc<QueryError>> {
        let state = self
            .inner
            .store
            .get(key)
            .ok_or_else(|| Arc::new(QueryError::fetch(format!("query {key} has no cached data"))))?;

        match (state.data, state.error) {
            (_, Some(error)) => Err(error),
            (Some(data), None) => Ok(data),
            (None, None) => Err(Arc::new(QueryError::fetch(format!("query {key} has no cached data")))),
        }
    }
}

impl Debug for QueryClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("name", &self.inner.name)
            .field("store", &self.inner.store)
            .field("fetcher", &self.inner.fetcher)
            .field("stampede_protection", &self.inner.stampede_protection)
            .finish_non_exhaustive()
    }
}
