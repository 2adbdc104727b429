// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! The keyed state store behind `quarry` query caches.
//!
//! This crate holds the data model shared by every query:
//!
//! - [`QueryKey`] and its canonical string form [`CanonicalKey`]
//! - [`QueryState`], the per-key record of data, error, flags and write time
//! - [`QueryStore`], which owns every entry and tracks listeners, subscriber counts and
//!   deferred eviction
//! - [`Snapshot`], a serializable export of the store for handoff between processes
//!
//! Higher layers decide when to fetch; the store only records what happened and tells
//! listeners about it.
//!
//! # Examples
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//! use anyspawn::Spawner;
//! use quarry_store::{QueryState, QueryStore, is_stale, now_millis, query_key};
//! use serde_json::json;
//! use tick::Clock;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let clock = Clock::new_tokio();
//! let store = QueryStore::builder(clock.clone(), Spawner::new_tokio()).build();
//! let key = query_key!["todos"].canonical();
//!
//! let now = now_millis(&clock);
//! store.set(key.clone(), QueryState::success(Arc::new(json!(["write docs"])), now));
//!
//! let state = store.get(&key).unwrap();
//! assert!(!is_stale(state.updated_at, now, Duration::from_secs(30)));
//! # }
//! ```

mod error;
mod key;
mod snapshot;
mod state;
mod store;

pub use error::{ErrorKind, QueryError, Result};
pub use key::{CanonicalKey, KeyPrefix, QueryKey};
pub use snapshot::Snapshot;
pub use state::{INVALIDATED, QueryState, is_stale, now_millis};
pub use store::{DEFAULT_CAPACITY, EvictionCause, EvictionHook, Listener, ListenerHandle, QueryStore, StoreBuilder};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
