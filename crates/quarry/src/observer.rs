// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-consumer query observation.

use std::{
    fmt::{self, Debug, Formatter},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use quarry_store::ListenerHandle;

use crate::{
    QueryClient, QueryError, QueryResult,
    compose::{ComposeContext, SelectMemo, compose},
    coordinator::FetchHooks,
    options::{OptionsChange, OptionsManager, QueryOptions},
    placeholder::PlaceholderSlot,
    tracking::{FieldReads, ShareStructure, TrackedFields, TrackedResult, changed_fields},
};

type SubscriberFn = Arc<dyn Fn(&QueryResult) + Send + Sync>;

/// The lifecycle of a [`QueryObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverStatus {
    /// Created but not started; serves cached data without fetching on its own.
    Uninitialized,
    /// Started; fetches when its data is missing, stale or invalidated.
    Active,
    /// Destroyed; no longer tracks its key.
    Destroyed,
}

/// Observes one query on behalf of one consumer.
///
/// An observer keeps its key alive in the cache, derives a [`QueryResult`] from the
/// cached entry (or a placeholder) and refreshes the entry when it is missing, stale or
/// invalidated. Subscribers are only notified when a field they read changed; see
/// [`tracked_result`](Self::tracked_result) and [`track`](Self::track).
///
/// Dropping an observer destroys it.
///
/// # Examples
///
/// ```
/// use anyspawn::Spawner;
/// use quarry::{QueryClient, QueryObserver, QueryOptions, query_key};
/// use serde_json::json;
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = QueryClient::builder(Clock::new_tokio(), Spawner::new_tokio()).build();
/// let options = QueryOptions::builder(query_key!["todos"])
///     .query_fn(|_| async { Ok(json!(["write docs"])) })
///     .build()
///     .unwrap();
///
/// let observer = QueryObserver::new(&client, options).unwrap();
/// assert!(observer.current_result().is_loading());
///
/// let result = observer.refetch(false).await;
/// assert!(result.is_success());
/// assert_eq!(result.data().map(|d| d[0].clone()), Some(json!("write docs")));
/// # }
/// ```
pub struct QueryObserver {
    inner: Arc<ObserverInner>,
}

struct ObserverInner {
    client: QueryClient,
    state: Mutex<ObserverState>,
    reads: FieldReads,
    placeholder: PlaceholderSlot,
    subscribers: Mutex<Vec<(u64, SubscriberFn)>>,
    // Latest result awaiting delivery; a drain is scheduled while this is `Some`.
    outbox: Mutex<Option<QueryResult>>,
    next_subscriber: AtomicU64,
    weak_self: Weak<Self>,
}

struct ObserverState {
    status: ObserverStatus,
    options: OptionsManager,
    result: QueryResult,
    memo: SelectMemo,
    listener: Option<ListenerHandle>,
}

impl QueryObserver {
    /// Creates an observer for `options` and computes its initial result.
    ///
    /// The observer subscribes to its key right away but does not fetch until
    /// [`start`](Self::start) or [`refetch`](Self::refetch) is called.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `client` cannot fetch `options`.
    pub fn new(client: &QueryClient, options: QueryOptions) -> Result<Self, QueryError> {
        client.check_options(&options)?;

        let inner = Arc::new_cyclic(|weak_self| ObserverInner {
            client: client.clone(),
            state: Mutex::new(ObserverState {
                status: ObserverStatus::Uninitialized,
                options: OptionsManager::new(options),
                result: QueryResult::loading(),
                memo: SelectMemo::default(),
                listener: None,
            }),
            reads: FieldReads::default(),
            placeholder: PlaceholderSlot::default(),
            subscribers: Mutex::new(Vec::new()),
            outbox: Mutex::new(None),
            next_subscriber: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        });

        inner.attach();
        inner.recompute();

        Ok(Self { inner })
    }

    /// Activates the observer and schedules its first fetch decision.
    ///
    /// The decision runs on the client's spawner, never within this call. Starting an
    /// active or destroyed observer does nothing.
    pub fn start(&self) {
        let started = {
            let mut state = self.inner.state.lock();
            if state.status == ObserverStatus::Uninitialized {
                state.status = ObserverStatus::Active;
                true
            } else {
                false
            }
        };

        if started {
            self.inner.spawn_fetch(false);
        }
    }

    /// Returns the observer's lifecycle status.
    #[must_use]
    pub fn status(&self) -> ObserverStatus {
        self.inner.state.lock().status
    }

    /// Returns the options the observer currently uses.
    #[must_use]
    pub fn options(&self) -> QueryOptions {
        self.inner.state.lock().options.current().clone()
    }

    /// Returns the latest result without tracking any field.
    #[must_use]
    pub fn current_result(&self) -> QueryResult {
        self.inner.state.lock().result.clone()
    }

    /// Returns the latest result, recording every field read through it.
    ///
    /// Once any field was read, subscribers are only notified when a read field changes.
    #[must_use]
    pub fn tracked_result(&self) -> TrackedResult {
        TrackedResult::new(self.current_result(), self.inner.reads.clone())
    }

    /// Declares `fields` as read, as if they had been accessed through
    /// [`tracked_result`](Self::tracked_result).
    pub fn track(&self, fields: TrackedFields) {
        self.inner.reads.mark(fields);
    }

    /// Returns the fields tracked so far.
    #[must_use]
    pub fn tracked_fields(&self) -> TrackedFields {
        self.inner.reads.get()
    }

    /// Calls `listener` with the new result whenever a tracked field changes.
    ///
    /// Listeners run on the client's spawner, never while the observer is locked.
    pub fn subscribe(&self, listener: impl Fn(&QueryResult) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(listener)));

        Subscription {
            id,
            observer: Arc::downgrade(&self.inner),
        }
    }

    /// Replaces the observer's options.
    ///
    /// Options that hash the same only swap in the new functions and recompute. Other
    /// changes under the same key recompute and, for an active observer, fetch if the
    /// data is stale. A new key moves the observer: the old key starts its eviction
    /// grace period, read tracking and the projection memo are reset and the new key is
    /// served from the cache, a placeholder or the loading state while it is fetched.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the client cannot fetch `options`; the current
    /// options are kept.
    pub fn set_options(&self, options: QueryOptions) -> Result<(), QueryError> {
        self.inner.client.check_options(&options)?;

        let change = {
            let mut state = self.inner.state.lock();
            if state.status == ObserverStatus::Destroyed {
                return Ok(());
            }
            state.options.apply(options)
        };

        match change {
            OptionsChange::Unchanged => self.inner.recompute(),
            OptionsChange::Updated => {
                self.inner.recompute();
                self.inner.fetch_if_active();
            }
            OptionsChange::KeyChanged(previous) => {
                self.inner.detach(&previous);
                self.inner.reads.reset();
                self.inner.placeholder.clear();
                self.inner.state.lock().memo = SelectMemo::default();

                self.inner.attach();
                self.inner.recompute();
                self.inner.fetch_if_active();
            }
        }

        Ok(())
    }

    /// Fetches now and returns the result once the fetch settles.
    ///
    /// With `force` the fetch ignores freshness and `enabled`; without it, this behaves
    /// like the fetch decision made by [`start`](Self::start).
    pub async fn refetch(&self, force: bool) -> QueryResult {
        self.inner.refetch(force).await
    }

    /// Stops observing: releases the key, drops every subscriber and clears transient
    /// state. Destroying twice does nothing.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl Debug for QueryObserver {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("QueryObserver")
            .field("key", state.options.current().canonical_key())
            .field("status", &state.status)
            .field("result", &state.result)
            .finish_non_exhaustive()
    }
}

impl ObserverInner {
    fn refetch_handle(&self) -> RefetchHandle {
        RefetchHandle(self.weak_self.clone())
    }

    fn hooks(&self) -> FetchHooks {
        FetchHooks {
            placeholder: Some(self.placeholder.clone()),
        }
    }

    /// Subscribes to the current key and listens for its changes.
    fn attach(&self) {
        let store = self.client.store();
        let key = self.state.lock().options.current().canonical_key().clone();

        store.subscribe(&key);

        let weak = self.weak_self.clone();
        let listener = store.listen(key, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.on_cache_update();
            }
        });

        self.state.lock().listener = Some(listener);
    }

    /// Stops listening to `previous` and releases its key.
    fn detach(&self, previous: &QueryOptions) {
        let listener = self.state.lock().listener.take();
        drop(listener);

        self.client
            .store()
            .unsubscribe(previous.canonical_key(), self.client.gc_time_for(previous));
    }

    fn compute(&self, options: &QueryOptions, memo: &mut SelectMemo) -> QueryResult {
        let store = self.client.store();
        let entry = store.get(options.canonical_key());

        if entry.is_some() {
            self.placeholder.clear();
        }

        let context = ComposeContext {
            options,
            now: self.client.now(),
            stale_time: self.client.stale_time_for(options),
            refetch: self.refetch_handle(),
        };

        compose(entry.as_ref(), context, memo, || self.placeholder.get_or_resolve(store, options))
    }

    /// Recomputes the result and schedules a notification if a tracked field changed.
    fn recompute(&self) {
        let changed = {
            let mut state = self.state.lock();
            if state.status == ObserverStatus::Destroyed {
                return;
            }

            let ObserverState { options, result, memo, .. } = &mut *state;
            let next = self.compute(options.current(), memo).share_from(result);
            let changed = changed_fields(result, &next);
            *result = next;

            changed.intersects(self.reads.get().interest()).then(|| result.clone())
        };

        if let Some(result) = changed {
            self.deliver(result);
        }
    }

    /// Queues `result` for subscribers, replacing any result not yet delivered.
    fn deliver(&self, result: QueryResult) {
        let schedule = self.outbox.lock().replace(result).is_none();
        if !schedule {
            return;
        }

        let weak = self.weak_self.clone();
        drop(self.client.spawner().spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.flush();
            }
        }));
    }

    fn flush(&self) {
        let Some(result) = self.outbox.lock().take() else {
            return;
        };

        let subscribers = self.subscribers.lock().clone();
        for (_, subscriber) in subscribers {
            subscriber(&result);
        }
    }

    fn on_cache_update(&self) {
        self.recompute();

        let refresh = {
            let state = self.state.lock();
            let options = state.options.current();
            let key = options.canonical_key();

            // A missing entry was removed, evicted or never written by a cancelled fetch.
            state.status == ObserverStatus::Active
                && options.is_enabled()
                && !self.client.is_key_in_flight(key)
                && self
                    .client
                    .store()
                    .get(key)
                    .is_none_or(|entry| entry.is_invalidated() && !entry.is_fetching)
        };

        if refresh {
            self.spawn_fetch(false);
        }
    }

    fn fetch_if_active(&self) {
        if self.state.lock().status == ObserverStatus::Active {
            self.spawn_fetch(false);
        }
    }

    fn spawn_fetch(&self, force: bool) {
        let options = self.state.lock().options.current().clone();
        let client = self.client.clone();
        let hooks = self.hooks();

        // The observer never aborts a fetch it started.
        drop(self.client.spawner().spawn(async move {
            let _ = client.refetch(&options, force, &hooks).await;
        }));
    }

    async fn refetch(&self, force: bool) -> QueryResult {
        let options = {
            let state = self.state.lock();
            if state.status == ObserverStatus::Destroyed {
                return state.result.clone();
            }
            state.options.current().clone()
        };

        let _ = self.client.refetch(&options, force, &self.hooks()).await;

        self.recompute();
        self.state.lock().result.clone()
    }

    fn destroy(&self) {
        let (options, listener) = {
            let mut state = self.state.lock();
            if state.status == ObserverStatus::Destroyed {
                return;
            }

            state.status = ObserverStatus::Destroyed;
            (state.options.current().clone(), state.listener.take())
        };

        drop(listener);
        self.client
            .store()
            .unsubscribe(options.canonical_key(), self.client.gc_time_for(&options));

        self.placeholder.clear();
        self.subscribers.lock().clear();
        *self.outbox.lock() = None;
        self.reads.reset();
    }
}

/// Refetches through the observer that produced a [`QueryResult`].
///
/// Holds the observer weakly; once the observer is gone, refetching does nothing.
#[derive(Clone)]
pub struct RefetchHandle(Weak<ObserverInner>);

impl RefetchHandle {
    /// A handle not bound to any observer.
    #[must_use]
    pub fn detached() -> Self {
        Self(Weak::new())
    }

    /// Forces a refetch and returns the observer's result once it settles, or `None` if
    /// the observer is gone.
    pub async fn refetch(&self) -> Option<QueryResult> {
        let inner = self.0.upgrade()?;
        Some(inner.refetch(true).await)
    }
}

impl Debug for RefetchHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefetchHandle").field("attached", &(self.0.strong_count() > 0)).finish()
    }
}

/// Keeps a listener subscribed to a [`QueryObserver`].
///
/// Dropping the subscription, or calling [`unsubscribe`](Self::unsubscribe), detaches the
/// listener.
#[must_use = "dropping the subscription detaches the listener"]
pub struct Subscription {
    id: u64,
    observer: Weak<ObserverInner>,
}

impl Subscription {
    /// Detaches the listener.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.upgrade() {
            observer.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish_non_exhaustive()
    }
}
