// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Declarative, observable data fetching on top of a keyed query cache.
//!
//! A [`QueryClient`] owns a [`QueryStore`] and the [`Fetcher`] that fills it. Queries are
//! described by [`QueryOptions`]: a [`QueryKey`], a source (a URL served by the fetcher, or
//! a query function), and how long fetched data stays fresh. A [`QueryObserver`] watches
//! one query for one consumer and exposes a [`QueryResult`] with the data, the error and
//! the loading, fetching, stale and placeholder flags.
//!
//! # Freshness and refresh
//!
//! Every entry records when it was written. An entry older than its stale time, or one
//! explicitly invalidated with [`QueryClient::invalidate_queries`], is refetched the next
//! time an active observer decides to fetch. Invalidated entries keep their data, so
//! consumers keep showing it while the refresh runs.
//!
//! # Notifications
//!
//! Writes never notify synchronously. The store queues the changed key and delivers the
//! notification on the client's [`Spawner`](anyspawn::Spawner), coalescing repeated writes
//! to the same key. Observers then recompute their result and notify their own
//! subscribers only when a field the subscriber reads has changed.
//!
//! # Lifetime
//!
//! Each observer counts as a subscriber of its key. When the last one goes away, the entry
//! is evicted after its grace period unless a new observer arrives first. Independently,
//! the store holds at most a fixed number of entries and evicts the least recently written
//! one when full.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use anyspawn::Spawner;
//! use quarry::{QueryClient, QueryObserver, QueryOptions, query_key};
//! use serde_json::json;
//! use tick::Clock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), quarry::QueryError> {
//! let client = QueryClient::builder(Clock::new_tokio(), Spawner::new_tokio())
//!     .default_stale_time(Duration::from_secs(60))
//!     .build();
//!
//! let options = QueryOptions::builder(query_key!["user", 1])
//!     .query_fn(|_| async { Ok(json!({ "id": 1, "name": "Ada" })) })
//!     .select(|user| user["name"].clone())
//!     .build()?;
//!
//! let observer = QueryObserver::new(&client, options)?;
//! let _subscription = observer.subscribe(|result| {
//!     println!("name: {:?}", result.data());
//! });
//!
//! let result = observer.refetch(false).await;
//! assert_eq!(result.data().map(|d| (**d).clone()), Some(json!("Ada")));
//!
//! // Keeps the data visible and marks it for refresh.
//! client.invalidate_queries(query_key!["user"]);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `test-util`: Enables [`testing::MockFetcher`], a scripted fetcher that records requests.

pub mod builder;
mod client;
mod compose;
mod coordinator;
mod fetch;
mod observer;
mod options;
mod placeholder;
mod telemetry;
#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;
mod tracking;

#[doc(inline)]
pub use builder::{DEFAULT_GC_TIME, QueryClientBuilder};
#[doc(inline)]
pub use client::{ClientName, QueryClient};
#[doc(inline)]
pub use compose::QueryResult;
#[doc(inline)]
pub use fetch::{FetchRequest, FetchResponse, Fetcher, Headers, Params, Schema};
#[doc(inline)]
pub use observer::{ObserverStatus, QueryObserver, RefetchHandle, Subscription};
#[doc(inline)]
pub use options::{PlaceholderCandidate, PlaceholderFn, QueryContext, QueryFn, QueryOptions, QueryOptionsBuilder};
#[doc(inline)]
pub use quarry_store::{
    CanonicalKey, ErrorKind, EvictionCause, INVALIDATED, KeyPrefix, QueryError, QueryKey, QueryState, QueryStore, Snapshot, is_stale,
    now_millis, query_key,
};
#[doc(inline)]
pub use tracking::{TrackedFields, TrackedResult};
