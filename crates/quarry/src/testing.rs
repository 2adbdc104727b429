// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scripted fetcher for tests.

use std::{collections::HashMap, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{FetchRequest, FetchResponse, Fetcher, QueryError};

#[derive(Debug, Clone)]
enum Scripted {
    Data(Value),
    Failure(String),
}

/// A [`Fetcher`] that answers from a per-URL script and records every request.
///
/// URLs without a script fail with a `404` fetch error. Responses can be held back with
/// [`hold`](Self::hold) to observe in-flight state, then let through with
/// [`release`](Self::release).
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "test-util")]
/// # fn main() {
/// use quarry::{FetchRequest, Fetcher, testing::MockFetcher};
/// use serde_json::json;
///
/// # futures::executor::block_on(async {
/// let fetcher = MockFetcher::new();
/// fetcher.respond("/users/1", json!({ "id": 1 }));
/// fetcher.fail("/users/2", "HTTP 500");
///
/// let ok = fetcher.fetch(FetchRequest::new("/users/1")).await.unwrap();
/// assert_eq!(ok.data, json!({ "id": 1 }));
/// assert!(fetcher.fetch(FetchRequest::new("/users/2")).await.is_err());
/// assert_eq!(fetcher.call_count("/users/1"), 1);
/// # });
/// # }
/// # #[cfg(not(feature = "test-util"))]
/// # fn main() {}
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockFetcher {
    script: Arc<Mutex<HashMap<String, Scripted>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
    gate: Arc<Mutex<Option<CancellationToken>>>,
}

impl MockFetcher {
    /// Creates a fetcher with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers requests for `url` with `data`.
    pub fn respond(&self, url: impl Into<String>, data: Value) {
        self.script.lock().insert(url.into(), Scripted::Data(data));
    }

    /// Fails requests for `url` with a fetch error carrying `message`.
    pub fn fail(&self, url: impl Into<String>, message: impl Into<String>) {
        self.script.lock().insert(url.into(), Scripted::Failure(message.into()));
    }

    /// Holds back every response until [`release`](Self::release) is called.
    pub fn hold(&self) {
        let mut gate = self.gate.lock();
        if gate.is_none() {
            *gate = Some(CancellationToken::new());
        }
    }

    /// Lets held responses through.
    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.cancel();
        }
    }

    /// Returns every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    /// Returns how many requests were made for `url`.
    #[must_use]
    pub fn call_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|request| request.url == url).count()
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, QueryError>> {
        let scripted = self.script.lock().get(&request.url).cloned();
        let gate = self.gate.lock().clone();
        let url = request.url.clone();
        self.requests.lock().push(request);

        async move {
            if let Some(gate) = gate {
                gate.cancelled_owned().await;
            }

            match scripted {
                Some(Scripted::Data(data)) => Ok(FetchResponse::ok(data)),
                Some(Scripted::Failure(message)) => Err(QueryError::fetch(message)),
                None => Err(QueryError::fetch(format!("HTTP 404 for {url}"))),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use serde_json::json;

    use super::*;

    #[test]
    fn unscripted_urls_fail() {
        let fetcher = MockFetcher::new();
        let error = block_on(fetcher.fetch(FetchRequest::new("/missing"))).expect_err("nothing scripted");

        assert!(error.to_string().contains("HTTP 404"));
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[test]
    fn held_responses_wait_for_release() {
        let fetcher = MockFetcher::new();
        fetcher.respond("/a", json!(1));
        fetcher.hold();

        let mut pending = fetcher.fetch(FetchRequest::new("/a"));
        assert!((&mut pending).now_or_never().is_none());

        fetcher.release();
        let response = block_on(pending).expect("released response");
        assert_eq!(response.data, json!(1));
    }
}
