// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `QueryStore`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyspawn::Spawner;
use quarry_store::{INVALIDATED, KeyPrefix, QueryError, QueryState, QueryStore, Snapshot, query_key};
use serde_json::json;
use tick::ClockControl;

fn new_store(control: &ClockControl) -> QueryStore {
    QueryStore::builder(control.to_clock(), Spawner::new_tokio()).build()
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn snapshot_round_trip_preserves_exportable_entries() {
    let control = ClockControl::new();
    let source = new_store(&control);

    let user = query_key!["user", 1].canonical();
    let failed = query_key!["user", 2].canonical();
    let pending = query_key!["user", 3].canonical();

    source.set(user.clone(), QueryState::success(Arc::new(json!({ "name": "Ada" })), 42));
    source.set(failed.clone(), QueryState::failure(Arc::new(QueryError::fetch("boom")), 43));
    source.set(
        pending.clone(),
        QueryState {
            is_loading: true,
            is_fetching: true,
            ..QueryState::default()
        },
    );

    let text = source.serialize().to_json().expect("snapshot should encode");

    let target = new_store(&control);
    let written = target.deserialize(Snapshot::from_json(&text).expect("snapshot should decode"));

    assert_eq!(written, 1);
    assert_eq!(target.get(&user), source.get(&user));
    assert!(!target.has(&failed));
    assert!(!target.has(&pending));
}

#[tokio::test]
async fn snapshot_is_idempotent() {
    let control = ClockControl::new();
    let store = new_store(&control);
    store.set(query_key!["a"].canonical(), QueryState::success(Arc::new(json!(1)), 5));

    let first = store.serialize();
    store.deserialize(first.clone());
    store.deserialize(first.clone());

    assert_eq!(store.serialize(), first);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn deserialize_keeps_subscribers_and_notifies() {
    let control = ClockControl::new();
    let store = new_store(&control);
    let key = query_key!["a"].canonical();
    let calls = Arc::new(AtomicUsize::new(0));

    store.subscribe(&key);
    let counter = Arc::clone(&calls);
    let _listener = store.listen(key.clone(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let snapshot: Snapshot = [(key.clone(), QueryState::success(Arc::new(json!(1)), 5))].into_iter().collect();
    store.deserialize(snapshot);
    settle().await;

    assert_eq!(store.subscriber_count(&key), 1);
    assert!(!store.has_pending_eviction(&key));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn serialized_entries_are_not_fetching() {
    let control = ClockControl::new();
    let store = new_store(&control);
    let key = query_key!["a"].canonical();

    let mut state = QueryState::success(Arc::new(json!(1)), 5);
    state.is_fetching = true;
    store.set(key.clone(), state);

    let snapshot = store.serialize();
    assert!(!snapshot.get(&key).expect("entry should be exported").is_fetching);
}

#[tokio::test]
async fn subscriber_counts_and_timers_stay_consistent() {
    let control = ClockControl::new();
    let store = new_store(&control);
    let key = query_key!["a"].canonical();
    store.set(key.clone(), QueryState::success(Arc::new(json!(1)), 5));

    // Interleave subscribes and unsubscribes; a timer exists only at a zero count.
    let steps: &[(bool, usize)] = &[(true, 1), (true, 2), (false, 1), (true, 2), (false, 1), (false, 0), (true, 1), (false, 0)];

    for &(subscribe, expected) in steps {
        if subscribe {
            store.subscribe(&key);
        } else {
            store.unsubscribe(&key, Duration::from_secs(60));
        }

        assert_eq!(store.subscriber_count(&key), expected);
        assert_eq!(store.has_pending_eviction(&key), expected == 0);
    }

    settle().await;
    control.advance(Duration::from_secs(60));
    settle().await;
    assert!(!store.has(&key));
}

#[tokio::test]
async fn delete_cancels_pending_eviction() {
    let control = ClockControl::new();
    let store = new_store(&control);
    let key = query_key!["a"].canonical();

    store.set(key.clone(), QueryState::success(Arc::new(json!(1)), 5));
    store.subscribe(&key);
    store.unsubscribe(&key, Duration::from_secs(1));

    assert!(store.delete(&key).is_some());
    assert!(!store.has_pending_eviction(&key));
}

#[tokio::test]
async fn invalidating_by_prefix_leaves_other_keys_untouched() {
    let control = ClockControl::new();
    let store = new_store(&control);
    let user = query_key!["user", 1].canonical();
    let post = query_key!["post", 1].canonical();

    store.set(user.clone(), QueryState::success(Arc::new(json!("u")), 100));
    store.set(post.clone(), QueryState::success(Arc::new(json!("p")), 100));

    let prefix = KeyPrefix::from(query_key!["user"]);
    for key in store.keys() {
        if prefix.matches(&key) {
            store.update(&key, |state| state.updated_at = INVALIDATED);
        }
    }

    assert_eq!(store.get(&user).map(|state| state.updated_at), Some(INVALIDATED));
    assert_eq!(store.get(&post).map(|state| state.updated_at), Some(100));
}
