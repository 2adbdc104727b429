// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deciding when to fetch, running the fetch and writing its outcome.

use std::{pin::pin, sync::Arc};

use futures::{
    FutureExt, TryFutureExt,
    future::{self, BoxFuture, Either},
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    QueryClient, QueryError, QueryState,
    fetch::FetchRequest,
    options::{QueryContext, QueryOptions, QuerySource},
    placeholder::PlaceholderSlot,
    telemetry::{QueryActivity, QueryOperation},
};

/// What happened when a fetch was requested.
#[derive(Debug)]
pub(crate) enum FetchOutcome {
    /// The query is disabled.
    Disabled,
    /// Cached data is still fresh.
    Fresh,
    /// Another fetch for the key is in flight and stampede protection is on.
    Deduplicated,
    /// The client cancelled the fetch before it settled; nothing was written.
    Cancelled,
    /// The fetch settled and its outcome was written to the store.
    Settled(Result<Arc<Value>, Arc<QueryError>>),
}

/// Observer state a fetch updates when it settles.
#[derive(Debug, Default, Clone)]
pub(crate) struct FetchHooks {
    pub placeholder: Option<PlaceholderSlot>,
}

impl QueryClient {
    /// Fetches if the query is enabled and its cached data is absent or stale.
    pub(crate) async fn execute_fetch(&self, options: &QueryOptions, hooks: &FetchHooks) -> FetchOutcome {
        if !options.is_enabled() {
            return FetchOutcome::Disabled;
        }

        self.fetch_if_stale(options, hooks).await
    }

    /// Fetches if cached data is absent or stale, regardless of `enabled`.
    pub(crate) async fn fetch_if_stale(&self, options: &QueryOptions, hooks: &FetchHooks) -> FetchOutcome {
        let key = options.canonical_key();

        if let Some(entry) = self.store().get(key)
            && !entry.is_stale(self.now(), self.stale_time_for(options))
        {
            self.record(QueryOperation::Fetch, QueryActivity::FetchSkippedFresh, Some(key), None);
            return FetchOutcome::Fresh;
        }

        self.fetch_data(options, hooks).await
    }

    /// Fetches unconditionally when `force` is set, otherwise like
    /// [`execute_fetch`](Self::execute_fetch).
    pub(crate) async fn refetch(&self, options: &QueryOptions, force: bool, hooks: &FetchHooks) -> FetchOutcome {
        if force {
            self.fetch_data(options, hooks).await
        } else {
            self.execute_fetch(options, hooks).await
        }
    }

    /// Runs the query's source and writes the outcome.
    ///
    /// Failures are written to the store like successes; this never fails.
    pub(crate) async fn fetch_data(&self, options: &QueryOptions, hooks: &FetchHooks) -> FetchOutcome {
        let key = options.canonical_key();

        if !self.begin_fetch(key) {
            self.record(QueryOperation::Fetch, QueryActivity::FetchDeduplicated, Some(key), None);
            return FetchOutcome::Deduplicated;
        }

        self.record(QueryOperation::Fetch, QueryActivity::FetchStarted, Some(key), None);
        if self.store().update(key, |state| state.is_fetching = true) {
            self.store().notify(key);
        }

        let stopwatch = self.clock().stopwatch();
        let cancellation = self.cancellation_token();
        let source = self.start_source(options, cancellation.clone());

        let result = match future::select(pin!(source), pin!(cancellation.cancelled())).await {
            Either::Left((result, _)) => result.and_then(|data| Self::post_process(options, data)),
            Either::Right(((), _)) => {
                self.end_fetch(key);
                // Notified even without an entry so callers waiting on the key wake up.
                self.store().update(key, |state| state.is_fetching = false);
                self.store().notify(key);

                tracing::debug!(query.key = key.as_str(), "query.fetch_cancelled");
                return FetchOutcome::Cancelled;
            }
        };

        let elapsed = stopwatch.elapsed();
        let result = result.map(Arc::new).map_err(Arc::new);

        if let Some(placeholder) = &hooks.placeholder {
            placeholder.clear();
        }

        let state = match &result {
            Ok(data) => QueryState::success(Arc::clone(data), self.now()),
            Err(error) => QueryState::failure(Arc::clone(error), self.now()),
        };
        self.store().set(key.clone(), state);
        self.end_fetch(key);

        let activity = if result.is_ok() {
            QueryActivity::FetchSucceeded
        } else {
            QueryActivity::FetchFailed
        };
        self.record(QueryOperation::Fetch, activity, Some(key), Some(elapsed));
        self.record_size();

        self.store().notify(key);
        FetchOutcome::Settled(result)
    }

    fn start_source(&self, options: &QueryOptions, cancellation: CancellationToken) -> BoxFuture<'static, Result<Value, QueryError>> {
        match &options.source {
            QuerySource::Function(query) => query(QueryContext {
                key: options.key().clone(),
                params: options.params().clone(),
                cancellation,
            }),
            QuerySource::Url(_) | QuerySource::UrlBuilder(_) => {
                let Some(fetcher) = self.fetcher() else {
                    return future::ready(Err(QueryError::configuration(format!(
                        "query {} fetches a url but client '{}' has no fetcher",
                        options.key(),
                        self.name()
                    ))))
                    .boxed();
                };

                let request = FetchRequest {
                    url: options.url().unwrap_or_default(),
                    params: options.params().clone(),
                    headers: options.headers().clone(),
                    cancellation,
                    schema: options.schema.clone(),
                };

                fetcher.fetch(request).map_ok(|response| response.data).boxed()
            }
        }
    }

    /// Validates, then transforms, a fetched payload.
    fn post_process(options: &QueryOptions, data: Value) -> Result<Value, QueryError> {
        let data = match &options.schema {
            Some(schema) => schema.validate(data).map_err(QueryError::validation)?,
            None => data,
        };

        Ok(match &options.transform {
            Some(transform) => transform(data),
            None => data,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use anyspawn::Spawner;
    use serde_json::json;
    use tick::ClockControl;

    use super::*;
    use crate::query_key;

    fn client(control: &ClockControl) -> QueryClient {
        QueryClient::builder(control.to_clock(), Spawner::new_tokio()).build()
    }

    fn counting(calls: &Arc<AtomicUsize>, value: Value) -> crate::QueryOptionsBuilder {
        let calls = Arc::clone(calls);
        QueryOptions::builder(query_key!["k"]).query_fn(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    #[tokio::test]
    async fn disabled_queries_never_fetch() {
        let control = ClockControl::new();
        let client = client(&control);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting(&calls, json!(1)).enabled(false).build().expect("options should build");

        assert!(matches!(client.execute_fetch(&options, &FetchHooks::default()).await, FetchOutcome::Disabled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_entries_are_refetched() {
        let control = ClockControl::new();
        let client = client(&control);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting(&calls, json!(1))
            .stale_time(Duration::from_secs(5))
            .build()
            .expect("options should build");
        let hooks = FetchHooks::default();

        assert!(matches!(client.execute_fetch(&options, &hooks).await, FetchOutcome::Settled(Ok(_))));
        assert!(matches!(client.execute_fetch(&options, &hooks).await, FetchOutcome::Fresh));

        control.advance(Duration::from_secs(6));
        assert!(matches!(client.execute_fetch(&options, &hooks).await, FetchOutcome::Settled(Ok(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forced_refetch_ignores_freshness() {
        let control = ClockControl::new();
        let client = client(&control);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting(&calls, json!(1))
            .stale_time(Duration::MAX)
            .build()
            .expect("options should build");
        let hooks = FetchHooks::default();

        let _ = client.refetch(&options, false, &hooks).await;
        assert!(matches!(client.refetch(&options, false, &hooks).await, FetchOutcome::Fresh));
        assert!(matches!(client.refetch(&options, true, &hooks).await, FetchOutcome::Settled(Ok(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidated_entries_are_refetched() {
        let control = ClockControl::new();
        let client = client(&control);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting(&calls, json!(1))
            .stale_time(Duration::MAX)
            .build()
            .expect("options should build");
        let hooks = FetchHooks::default();

        let _ = client.execute_fetch(&options, &hooks).await;
        client.invalidate_queries(query_key!["k"]);
        let _ = client.execute_fetch(&options, &hooks).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_writes_settled_state() {
        let control = ClockControl::new();
        control.advance(Duration::from_millis(1_500));
        let client = client(&control);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting(&calls, json!({ "id": 1 }))
            .transform(|mut value| {
                value["seen"] = json!(true);
                value
            })
            .build()
            .expect("options should build");

        let _ = client.fetch_data(&options, &FetchHooks::default()).await;
        let state = client.get_query_state(query_key!["k"]).expect("state written");

        assert_eq!(state.data.as_deref(), Some(&json!({ "id": 1, "seen": true })));
        assert!(state.error.is_none());
        assert!(!state.is_loading);
        assert!(!state.is_fetching);
        assert_eq!(state.updated_at, 1_500);
    }

    #[tokio::test]
    async fn schema_failures_are_stored_as_validation_errors() {
        let control = ClockControl::new();
        let client = client(&control);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting(&calls, json!("not an object"))
            .schema(|value: Value| {
                if value.is_object() {
                    Ok(value)
                } else {
                    Err("expected an object")
                }
            })
            .build()
            .expect("options should build");

        let outcome = client.fetch_data(&options, &FetchHooks::default()).await;
        let FetchOutcome::Settled(Err(error)) = outcome else {
            unreachable!("validation must fail, got {outcome:?}");
        };

        assert!(error.is_validation());
        let state = client.get_query_state(query_key!["k"]).expect("state written");
        assert!(state.data.is_none());
        assert!(Arc::ptr_eq(state.error.as_ref().expect("error stored"), &error));
    }

    #[tokio::test]
    async fn settled_fetch_clears_placeholder() {
        let control = ClockControl::new();
        let client = client(&control);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = counting(&calls, json!(1)).build().expect("options should build");

        let slot = PlaceholderSlot::default();
        slot.set(Arc::new(json!("provisional")));
        let hooks = FetchHooks {
            placeholder: Some(slot.clone()),
        };

        let _ = client.fetch_data(&options, &hooks).await;
        assert!(slot.get().is_none());
    }

    #[tokio::test]
    async fn stampede_protection_skips_concurrent_fetch() {
        let control = ClockControl::new();
        let client = QueryClient::builder(control.to_clock(), Spawner::new_tokio())
            .stampede_protection()
            .build();
        let key = query_key!["k"].canonical();

        assert!(client.begin_fetch(&key));
        let options = QueryOptions::builder(query_key!["k"])
            .query_fn(|_| async { Ok(json!(1)) })
            .build()
            .expect("options should build");

        assert!(matches!(client.fetch_data(&options, &FetchHooks::default()).await, FetchOutcome::Deduplicated));
        client.end_fetch(&key);
        assert!(matches!(client.fetch_data(&options, &FetchHooks::default()).await, FetchOutcome::Settled(_)));
    }

    #[tokio::test]
    async fn fetcher_receives_request() {
        let control = ClockControl::new();
        let fetcher = crate::testing::MockFetcher::new();
        fetcher.respond("/users/7", json!({ "id": 7 }));

        let client = QueryClient::builder(control.to_clock(), Spawner::new_tokio())
            .fetcher(fetcher.clone())
            .build();
        let options = QueryOptions::builder(query_key!["user", 7])
            .param("id", 7)
            .header("accept", "application/json")
            .url_with(|params| format!("/users/{}", params["id"]))
            .build()
            .expect("options should build");

        let _ = client.fetch_data(&options, &FetchHooks::default()).await;

        let requests = fetcher.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "/users/7");
        assert_eq!(requests[0].headers.get("accept").map(String::as_str), Some("application/json"));
        assert_eq!(client.get_query_data(query_key!["user", 7]).as_deref(), Some(&json!({ "id": 7 })));
    }
}
