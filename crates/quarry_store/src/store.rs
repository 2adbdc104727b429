// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The keyed query store.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::{self, Debug, Formatter},
    mem,
    num::NonZeroUsize,
    sync::{Arc, Weak},
    time::Duration,
};

use anyspawn::Spawner;
use futures::future::{AbortHandle, abortable};
use lru::LruCache;
use parking_lot::Mutex;
use tick::Clock;

use crate::{CanonicalKey, QueryState, Snapshot};

/// The default maximum number of entries a store holds.
pub const DEFAULT_CAPACITY: usize = 1000;

/// A callback invoked with the key of a changed entry.
pub type Listener = Arc<dyn Fn(&CanonicalKey) + Send + Sync>;

/// A callback invoked after an entry leaves the store without an explicit delete.
pub type EvictionHook = Arc<dyn Fn(&CanonicalKey, EvictionCause) + Send + Sync>;

/// Why an entry was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    /// The last subscriber left and the grace period elapsed.
    Expired,
    /// The store was full and this entry was the least recently written.
    Capacity,
}

/// Holds the state of every query, keyed by [`CanonicalKey`].
///
/// The store is the single source of truth for fetched data. It also keeps:
///
/// - per-key listeners, notified asynchronously and coalesced per key,
/// - per-key subscriber counts, and
/// - a deferred eviction timer for each key whose last subscriber left.
///
/// Writes never invoke listeners directly; call [`notify`](Self::notify) to schedule a
/// dispatch on the store's [`Spawner`], or [`dispatch_pending`](Self::dispatch_pending) to
/// flush immediately. The store is cheap to clone and every clone shares the same entries.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use anyspawn::Spawner;
/// use quarry_store::{QueryState, QueryStore, query_key};
/// use serde_json::json;
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = QueryStore::builder(Clock::new_tokio(), Spawner::new_tokio()).capacity(100).build();
/// let key = query_key!["user", 1].canonical();
///
/// store.set(key.clone(), QueryState::success(Arc::new(json!({ "name": "Ada" })), 1));
/// assert!(store.has(&key));
/// # }
/// ```
#[derive(Clone)]
pub struct QueryStore {
    shared: Arc<Shared>,
}

struct Shared {
    clock: Clock,
    spawner: Spawner,
    on_evict: Option<EvictionHook>,
    state: Mutex<StoreState>,
}

struct StoreState {
    entries: LruCache<CanonicalKey, QueryState>,
    subscribers: HashMap<CanonicalKey, usize>,
    timers: HashMap<CanonicalKey, EvictionTimer>,
    listeners: HashMap<CanonicalKey, Vec<(u64, Listener)>>,
    pending: Vec<CanonicalKey>,
    drain_scheduled: bool,
    next_id: u64,
}

struct EvictionTimer {
    id: u64,
    // `None` when the grace period never elapses.
    abort: Option<AbortHandle>,
}

impl EvictionTimer {
    fn cancel(self) {
        if let Some(abort) = self.abort {
            abort.abort();
        }
    }
}

impl StoreState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Queues `key` for dispatch, returning `true` if a drain must be scheduled.
    fn enqueue(&mut self, key: CanonicalKey) -> bool {
        if !self.pending.contains(&key) {
            self.pending.push(key);
        }

        !mem::replace(&mut self.drain_scheduled, true)
    }

    fn cancel_timer(&mut self, key: &CanonicalKey) {
        if let Some(timer) = self.timers.remove(key) {
            timer.cancel();
        }
    }

    /// Inserts an entry, returning the key of an entry evicted to make room.
    fn insert(&mut self, key: CanonicalKey, state: QueryState) -> Option<CanonicalKey> {
        match self.entries.push(key.clone(), state) {
            Some((evicted, _)) if evicted != key => {
                self.subscribers.remove(&evicted);
                self.cancel_timer(&evicted);
                Some(evicted)
            }
            _ => None,
        }
    }
}

/// Configures and creates a [`QueryStore`].
#[must_use]
pub struct StoreBuilder {
    clock: Clock,
    spawner: Spawner,
    capacity: NonZeroUsize,
    on_evict: Option<EvictionHook>,
}

impl Debug for StoreBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder").field("capacity", &self.capacity).finish_non_exhaustive()
    }
}

impl StoreBuilder {
    /// Sets the maximum number of entries. Zero is treated as one.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        self
    }

    /// Registers a callback invoked whenever an entry is evicted.
    ///
    /// The callback runs outside the store lock and may call back into the store.
    pub fn on_evict(mut self, hook: impl Fn(&CanonicalKey, EvictionCause) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Arc::new(hook));
        self
    }

    /// Creates the store.
    pub fn build(self) -> QueryStore {
        QueryStore {
            shared: Arc::new(Shared {
                clock: self.clock,
                spawner: self.spawner,
                on_evict: self.on_evict,
                state: Mutex::new(StoreState {
                    entries: LruCache::new(self.capacity),
                    subscribers: HashMap::new(),
                    timers: HashMap::new(),
                    listeners: HashMap::new(),
                    pending: Vec::new(),
                    drain_scheduled: false,
                    next_id: 0,
                }),
            }),
        }
    }
}

impl QueryStore {
    /// Starts building a store that reads time from `clock` and runs timers and
    /// dispatches on `spawner`.
    pub fn builder(clock: Clock, spawner: Spawner) -> StoreBuilder {
        StoreBuilder {
            clock,
            spawner,
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            on_evict: None,
        }
    }

    /// Returns the clock this store was built with.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.shared.clock
    }

    /// Returns the spawner this store was built with.
    #[must_use]
    pub fn spawner(&self) -> &Spawner {
        &self.shared.spawner
    }

    /// Returns a copy of the entry for `key`. Reads do not affect eviction order.
    #[must_use]
    pub fn get(&self, key: &CanonicalKey) -> Option<QueryState> {
        self.shared.state.lock().entries.peek(key).cloned()
    }

    /// Returns `true` if an entry exists for `key`.
    #[must_use]
    pub fn has(&self, key: &CanonicalKey) -> bool {
        self.shared.state.lock().entries.contains(key)
    }

    /// Writes the entry for `key`, evicting the least recently written entry when full.
    ///
    /// Listeners are not notified; see [`notify`](Self::notify).
    pub fn set(&self, key: CanonicalKey, state: QueryState) {
        let evicted = self.shared.state.lock().insert(key, state);

        if let Some(evicted) = evicted {
            self.evicted(&evicted, EvictionCause::Capacity);
        }
    }

    /// Modifies the entry for `key` in place, returning `false` if there is none.
    pub fn update(&self, key: &CanonicalKey, f: impl FnOnce(&mut QueryState)) -> bool {
        let mut state = self.shared.state.lock();
        state.entries.get_mut(key).map(f).is_some()
    }

    /// Removes the entry for `key` and cancels its pending eviction.
    ///
    /// Subscriber counts are kept, as subscribers may still be attached.
    pub fn delete(&self, key: &CanonicalKey) -> Option<QueryState> {
        let mut state = self.shared.state.lock();
        state.cancel_timer(key);
        state.entries.pop(key)
    }

    /// Removes every entry and cancels all pending evictions, returning the removed keys.
    pub fn clear(&self) -> Vec<CanonicalKey> {
        let mut state = self.shared.state.lock();

        for (_, timer) in state.timers.drain() {
            timer.cancel();
        }

        let keys = state.entries.iter().map(|(key, _)| key.clone()).collect();
        state.entries.clear();
        keys
    }

    /// Returns a copy of every entry, ordered by key.
    #[must_use]
    pub fn get_all(&self) -> BTreeMap<CanonicalKey, QueryState> {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .map(|(key, state)| (key.clone(), state.clone()))
            .collect()
    }

    /// Returns every key currently stored.
    #[must_use]
    pub fn keys(&self) -> Vec<CanonicalKey> {
        self.shared.state.lock().entries.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Returns the most recently updated entry accepted by `predicate`.
    pub fn find_latest(&self, mut predicate: impl FnMut(&CanonicalKey, &QueryState) -> bool) -> Option<(CanonicalKey, QueryState)> {
        let state = self.shared.state.lock();

        state
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, entry))
            .max_by_key(|(_, entry)| entry.updated_at)
            .map(|(key, entry)| (key.clone(), entry.clone()))
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// Returns `true` if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().entries.cap().get()
    }

    /// Registers `listener` for changes to `key`.
    ///
    /// The listener stays registered until the returned handle is dropped.
    pub fn listen(&self, key: CanonicalKey, listener: impl Fn(&CanonicalKey) + Send + Sync + 'static) -> ListenerHandle {
        let mut state = self.shared.state.lock();
        let id = state.next_id();
        state.listeners.entry(key.clone()).or_default().push((id, Arc::new(listener)));

        ListenerHandle {
            key,
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Returns the number of listeners registered for `key`.
    #[must_use]
    pub fn listener_count(&self, key: &CanonicalKey) -> usize {
        self.shared.state.lock().listeners.get(key).map_or(0, Vec::len)
    }

    /// Schedules a notification for `key`.
    ///
    /// Listeners run later on the spawner. Several notifications for the same key before
    /// the dispatch runs are delivered once.
    pub fn notify(&self, key: &CanonicalKey) {
        let schedule = self.shared.state.lock().enqueue(key.clone());

        if schedule {
            let shared = Arc::downgrade(&self.shared);

            // The task is detached; dropping the handle does not cancel it.
            drop(self.shared.spawner.spawn(async move {
                if let Some(shared) = shared.upgrade() {
                    Self { shared }.dispatch_pending();
                }
            }));
        }
    }

    /// Delivers every queued notification now.
    ///
    /// Listeners are invoked without the store lock held.
    pub fn dispatch_pending(&self) {
        let batch: Vec<(CanonicalKey, Vec<(u64, Listener)>)> = {
            let mut state = self.shared.state.lock();
            state.drain_scheduled = false;

            mem::take(&mut state.pending)
                .into_iter()
                .map(|key| {
                    let listeners = state.listeners.get(&key).cloned().unwrap_or_default();
                    (key, listeners)
                })
                .collect()
        };

        for (key, listeners) in batch {
            for (id, listener) in listeners {
                if self.is_listening(&key, id) {
                    listener(&key);
                }
            }
        }
    }

    fn is_listening(&self, key: &CanonicalKey, id: u64) -> bool {
        self.shared
            .state
            .lock()
            .listeners
            .get(key)
            .is_some_and(|listeners| listeners.iter().any(|(candidate, _)| *candidate == id))
    }

    /// Records a new subscriber for `key`, cancelling any pending eviction.
    pub fn subscribe(&self, key: &CanonicalKey) {
        let mut state = self.shared.state.lock();
        *state.subscribers.entry(key.clone()).or_insert(0) += 1;
        state.cancel_timer(key);
    }

    /// Releases a subscriber of `key`.
    ///
    /// When the last subscriber leaves, the entry is evicted once `grace` elapses unless
    /// a new subscriber arrives first. Releasing a key with no subscribers is ignored.
    pub fn unsubscribe(&self, key: &CanonicalKey, grace: Duration) {
        let mut state = self.shared.state.lock();

        let Some(count) = state.subscribers.get_mut(key) else {
            tracing::warn!(query.key = key.as_str(), "query.store.unbalanced_unsubscribe");
            return;
        };

        *count -= 1;
        if *count > 0 {
            return;
        }

        state.subscribers.remove(key);
        state.cancel_timer(key);

        let id = state.next_id();
        let Some(deadline) = self.shared.clock.instant().checked_add(grace) else {
            state.timers.insert(key.clone(), EvictionTimer { id, abort: None });
            return;
        };

        // The deadline is fixed at unsubscribe time.
        let clock = self.shared.clock.clone();
        let (delay, abort) = abortable(async move {
            clock.delay(deadline.saturating_duration_since(clock.instant())).await;
        });
        state.timers.insert(key.clone(), EvictionTimer { id, abort: Some(abort) });
        drop(state);

        let shared = Arc::downgrade(&self.shared);
        let key = key.clone();

        drop(self.shared.spawner.spawn(async move {
            if delay.await.is_ok()
                && let Some(shared) = shared.upgrade()
            {
                Self { shared }.expire(&key, id);
            }
        }));
    }

    /// Returns the number of subscribers of `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &CanonicalKey) -> usize {
        self.shared.state.lock().subscribers.get(key).copied().unwrap_or(0)
    }

    /// Returns `true` if `key` is waiting out its eviction grace period.
    #[must_use]
    pub fn has_pending_eviction(&self, key: &CanonicalKey) -> bool {
        self.shared.state.lock().timers.contains_key(key)
    }

    fn expire(&self, key: &CanonicalKey, id: u64) {
        let removed = {
            let mut state = self.shared.state.lock();

            if !state.timers.get(key).is_some_and(|timer| timer.id == id) {
                return;
            }

            state.timers.remove(key);
            !state.subscribers.contains_key(key) && state.entries.pop(key).is_some()
        };

        if removed {
            self.evicted(key, EvictionCause::Expired);
        }
    }

    fn evicted(&self, key: &CanonicalKey, cause: EvictionCause) {
        tracing::debug!(query.key = key.as_str(), query.eviction = ?cause, "query.store.evicted");

        if let Some(hook) = &self.shared.on_evict {
            hook(key, cause);
        }

        if cause == EvictionCause::Capacity {
            self.notify(key);
        }
    }

    /// Exports every entry that holds data and no error.
    ///
    /// Exported entries are marked as not fetching, since no fetch survives the handoff.
    #[must_use]
    pub fn serialize(&self) -> Snapshot {
        let state = self.shared.state.lock();

        state
            .entries
            .iter()
            .filter(|(_, entry)| entry.data.is_some() && entry.error.is_none())
            .map(|(key, entry)| {
                let mut exported = entry.clone();
                exported.is_loading = false;
                exported.is_fetching = false;
                (key.clone(), exported)
            })
            .collect()
    }

    /// Merges `snapshot` into the store, returning the number of entries written.
    ///
    /// Existing entries with the same keys are replaced; subscriber counts and pending
    /// evictions are left alone. Every written key is notified.
    pub fn deserialize(&self, snapshot: Snapshot) -> usize {
        let (written, evicted) = {
            let mut state = self.shared.state.lock();
            let mut written = Vec::with_capacity(snapshot.len());
            let mut evicted = Vec::new();

            for (key, entry) in snapshot {
                evicted.extend(state.insert(key.clone(), entry));
                written.push(key);
            }

            (written, evicted)
        };

        for key in &evicted {
            self.evicted(key, EvictionCause::Capacity);
        }

        for key in &written {
            self.notify(key);
        }

        written.len()
    }
}

impl Debug for QueryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// Keeps a listener registered with a [`QueryStore`].
///
/// Dropping the handle removes the listener. A listener removed while a dispatch is in
/// progress is not invoked by that dispatch.
#[must_use = "dropping the handle removes the listener"]
pub struct ListenerHandle {
    key: CanonicalKey,
    id: u64,
    shared: Weak<Shared>,
}

impl ListenerHandle {
    /// Returns the key this listener watches.
    #[must_use]
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }
}

impl Debug for ListenerHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("key", &self.key).finish_non_exhaustive()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let mut state = shared.state.lock();
        if let Some(listeners) = state.listeners.get_mut(&self.key) {
            listeners.retain(|(id, _)| *id != self.id);
            if listeners.is_empty() {
                state.listeners.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tick::ClockControl;

    use super::*;
    use crate::query_key;

    fn store(control: &ClockControl, capacity: usize) -> QueryStore {
        QueryStore::builder(control.to_clock(), Spawner::new_tokio()).capacity(capacity).build()
    }

    fn entry(value: i64) -> QueryState {
        QueryState::success(Arc::new(json!(value)), 10)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_written() {
        let control = ClockControl::new();
        let store = store(&control, 2);
        let (a, b, c) = (query_key!["a"].canonical(), query_key!["b"].canonical(), query_key!["c"].canonical());

        store.set(a.clone(), entry(1));
        store.set(b.clone(), entry(2));
        let _ = store.get(&a);
        store.set(c.clone(), entry(3));

        assert!(!store.has(&a), "reads must not refresh eviction order");
        assert!(store.has(&b));
        assert!(store.has(&c));
    }

    #[tokio::test]
    async fn update_refreshes_eviction_order() {
        let control = ClockControl::new();
        let store = store(&control, 2);
        let (a, b, c) = (query_key!["a"].canonical(), query_key!["b"].canonical(), query_key!["c"].canonical());

        store.set(a.clone(), entry(1));
        store.set(b.clone(), entry(2));
        assert!(store.update(&a, |state| state.is_fetching = true));
        store.set(c.clone(), entry(3));

        assert!(store.has(&a));
        assert!(!store.has(&b));
    }

    #[tokio::test]
    async fn capacity_eviction_clears_subscribers_and_timers() {
        let control = ClockControl::new();
        let store = store(&control, 1);
        let (a, b) = (query_key!["a"].canonical(), query_key!["b"].canonical());

        store.set(a.clone(), entry(1));
        store.subscribe(&a);
        store.unsubscribe(&a, Duration::from_secs(5));
        assert!(store.has_pending_eviction(&a));
        store.set(b.clone(), entry(2));
        assert!(!store.has_pending_eviction(&a));

        store.subscribe(&b);
        store.set(a.clone(), entry(3));
        assert!(!store.has(&b));
        assert_eq!(store.subscriber_count(&b), 0);
    }

    #[tokio::test]
    async fn grace_period_starts_at_unsubscribe() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();

        store.set(key.clone(), entry(1));
        store.subscribe(&key);
        store.unsubscribe(&key, Duration::from_secs(10));

        // Time moves before the eviction task ever runs.
        control.advance(Duration::from_secs(11));
        settle().await;

        assert!(!store.has(&key));
        assert!(!store.has_pending_eviction(&key));
    }

    #[tokio::test]
    async fn grace_period_is_not_cut_short() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();

        store.set(key.clone(), entry(1));
        store.subscribe(&key);
        store.unsubscribe(&key, Duration::from_secs(10));
        settle().await;

        control.advance(Duration::from_secs(9));
        settle().await;
        assert!(store.has(&key));

        control.advance(Duration::from_secs(2));
        settle().await;
        assert!(!store.has(&key));
    }

    #[tokio::test]
    async fn notifications_are_deferred_and_coalesced() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let _handle = store.listen(key.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.notify(&key);
        store.notify(&key);
        store.notify(&key);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_pending_flushes_synchronously() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let _handle = store.listen(key.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.notify(&key);
        store.dispatch_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_listener_is_not_invoked() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let handle = store.listen(key.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.listener_count(&key), 1);

        store.notify(&key);
        drop(handle);
        store.dispatch_pending();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.listener_count(&key), 0);
    }

    #[tokio::test]
    async fn last_unsubscribe_evicts_after_grace() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();

        store.set(key.clone(), entry(1));
        store.subscribe(&key);
        store.unsubscribe(&key, Duration::from_secs(5));
        assert!(store.has_pending_eviction(&key));
        settle().await;

        control.advance(Duration::from_secs(4));
        settle().await;
        assert!(store.has(&key));

        control.advance(Duration::from_secs(1));
        settle().await;
        assert!(!store.has(&key));
        assert!(!store.has_pending_eviction(&key));
    }

    #[tokio::test]
    async fn resubscribe_cancels_eviction() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();

        store.set(key.clone(), entry(1));
        store.subscribe(&key);
        store.unsubscribe(&key, Duration::from_secs(5));
        settle().await;
        store.subscribe(&key);
        assert!(!store.has_pending_eviction(&key));

        control.advance(Duration::from_secs(10));
        settle().await;
        assert!(store.has(&key));
        assert_eq!(store.subscriber_count(&key), 1);
    }

    #[tokio::test]
    async fn unbalanced_unsubscribe_is_ignored() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();

        store.unsubscribe(&key, Duration::ZERO);
        assert_eq!(store.subscriber_count(&key), 0);
        assert!(!store.has_pending_eviction(&key));
    }

    #[tokio::test]
    async fn infinite_grace_never_evicts() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let key = query_key!["a"].canonical();

        store.set(key.clone(), entry(1));
        store.subscribe(&key);
        store.unsubscribe(&key, Duration::MAX);
        assert!(store.has_pending_eviction(&key));

        control.advance(Duration::from_secs(86_400));
        settle().await;
        assert!(store.has(&key));
    }

    #[tokio::test]
    async fn eviction_hook_reports_cause() {
        let control = ClockControl::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let store = QueryStore::builder(control.to_clock(), Spawner::new_tokio())
            .capacity(1)
            .on_evict(move |key, cause| sink.lock().push((key.clone(), cause)))
            .build();
        let (a, b) = (query_key!["a"].canonical(), query_key!["b"].canonical());

        store.set(a.clone(), entry(1));
        store.set(b.clone(), entry(2));
        store.subscribe(&b);
        store.unsubscribe(&b, Duration::ZERO);
        settle().await;

        assert_eq!(*seen.lock(), vec![(a, EvictionCause::Capacity), (b, EvictionCause::Expired)]);
    }

    #[tokio::test]
    async fn clear_cancels_all_timers() {
        let control = ClockControl::new();
        let store = store(&control, 10);
        let (a, b) = (query_key!["a"].canonical(), query_key!["b"].canonical());

        store.set(a.clone(), entry(1));
        store.set(b.clone(), entry(2));
        store.subscribe(&a);
        store.unsubscribe(&a, Duration::from_secs(1));

        let mut removed = store.clear();
        removed.sort();
        assert_eq!(removed, vec![a.clone(), b]);
        assert!(store.is_empty());
        assert!(!store.has_pending_eviction(&a));
    }

    #[tokio::test]
    async fn find_latest_prefers_newest() {
        let control = ClockControl::new();
        let store = store(&control, 10);

        store.set(query_key!["a", 1].canonical(), QueryState::success(Arc::new(json!(1)), 5));
        store.set(query_key!["a", 2].canonical(), QueryState::success(Arc::new(json!(2)), 9));
        store.set(query_key!["b", 3].canonical(), QueryState::success(Arc::new(json!(3)), 20));

        let (key, _) = store
            .find_latest(|key, _| key.discriminator() == Some(json!("a")))
            .expect("a match should exist");
        assert_eq!(key, query_key!["a", 2].canonical());
    }
}
