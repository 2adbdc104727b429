// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The observable result of a query and how it is derived from cache state.

use std::{sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    QueryError, QueryState, RefetchHandle,
    options::{QueryOptions, Selector},
    tracking::changed_fields,
};

/// What an observer exposes for its query.
///
/// `is_success` and `is_error` are never both `true`, and a result backed by a cache entry
/// never reports placeholder data.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub(crate) data: Option<Arc<Value>>,
    pub(crate) error: Option<Arc<QueryError>>,
    pub(crate) is_loading: bool,
    pub(crate) is_fetching: bool,
    pub(crate) is_error: bool,
    pub(crate) is_success: bool,
    pub(crate) is_stale: bool,
    pub(crate) is_placeholder_data: bool,
    pub(crate) refetch: RefetchHandle,
}

impl QueryResult {
    /// The result of a query that has nothing cached and is waiting for its first fetch.
    pub(crate) fn loading() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: true,
            is_fetching: true,
            is_error: false,
            is_success: false,
            is_stale: false,
            is_placeholder_data: false,
            refetch: RefetchHandle::detached(),
        }
    }

    fn idle(refetch: RefetchHandle) -> Self {
        Self {
            is_loading: false,
            is_fetching: false,
            refetch,
            ..Self::loading()
        }
    }

    /// The (projected) data, if any.
    #[must_use]
    pub fn data(&self) -> Option<&Arc<Value>> {
        self.data.as_ref()
    }

    /// Deserializes the data into `T`.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the data does not have the shape of `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, QueryError> {
        self.data
            .as_deref()
            .map(|data| T::deserialize(data).map_err(QueryError::validation))
            .transpose()
    }

    /// The error of the last fetch, if it failed.
    #[must_use]
    pub fn error(&self) -> Option<&Arc<QueryError>> {
        self.error.as_ref()
    }

    /// `true` while there is nothing to show yet.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    /// `true` while a fetch is in flight.
    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.is_fetching
    }

    /// `true` if an error is present.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.is_error
    }

    /// `true` if data is present and no error is.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.is_success
    }

    /// `true` if the data should be refreshed.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// `true` if the data is a placeholder rather than a fetched value.
    #[must_use]
    pub fn is_placeholder_data(&self) -> bool {
        self.is_placeholder_data
    }

    /// Forces a refetch through the observer that produced this result.
    ///
    /// Returns the observer's result once the fetch settles, or `None` if the observer is
    /// gone.
    pub async fn refetch(&self) -> Option<Self> {
        self.refetch.refetch().await
    }
}

impl PartialEq for QueryResult {
    fn eq(&self, other: &Self) -> bool {
        changed_fields(self, other).is_empty()
    }
}

/// Memoizes an observer's projection.
///
/// A projection with declared dependencies is reused while its dependencies and input
/// are unchanged. Without dependencies it is reused while the function itself is the
/// same allocation and the input is unchanged.
#[derive(Default)]
pub(crate) struct SelectMemo {
    last: Option<Memoized>,
}

struct Memoized {
    selector: Selector,
    input: Arc<Value>,
    output: Arc<Value>,
}

impl Memoized {
    fn reusable(&self, selector: &Selector, input: &Arc<Value>) -> bool {
        let same_input = Arc::ptr_eq(&self.input, input) || self.input == *input;
        let same_projection = match (&selector.deps, &self.selector.deps) {
            (Some(deps), Some(previous)) => deps == previous,
            (None, None) => Arc::ptr_eq(&selector.func, &self.selector.func),
            _ => false,
        };

        same_input && same_projection
    }
}

impl SelectMemo {
    pub(crate) fn project(&mut self, selector: Option<&Selector>, input: Option<&Arc<Value>>) -> Option<Arc<Value>> {
        let input = input?;
        let Some(selector) = selector else {
            return Some(Arc::clone(input));
        };

        if let Some(last) = &self.last
            && last.reusable(selector, input)
        {
            return Some(Arc::clone(&last.output));
        }

        let output = Arc::new((selector.func)(input));
        self.last = Some(Memoized {
            selector: selector.clone(),
            input: Arc::clone(input),
            output: Arc::clone(&output),
        });

        Some(output)
    }
}

/// The inputs of [`compose`] besides the cache entry.
pub(crate) struct ComposeContext<'a> {
    pub options: &'a QueryOptions,
    pub now: u64,
    pub stale_time: Duration,
    pub refetch: RefetchHandle,
}

/// Derives the observable result for a query.
///
/// `placeholder` is only consulted when the query is enabled and nothing is cached.
pub(crate) fn compose(
    entry: Option<&QueryState>,
    context: ComposeContext<'_>,
    memo: &mut SelectMemo,
    placeholder: impl FnOnce() -> Option<Arc<Value>>,
) -> QueryResult {
    let ComposeContext {
        options,
        now,
        stale_time,
        refetch,
    } = context;
    let selector = options.select.as_ref();

    if let Some(entry) = entry {
        let data = memo.project(selector, entry.data.as_ref());
        let error = entry.error.clone();
        let enabled = options.is_enabled();

        return QueryResult {
            is_loading: enabled && entry.is_loading,
            is_fetching: enabled && entry.is_fetching,
            is_error: error.is_some(),
            is_success: error.is_none() && data.is_some(),
            is_stale: entry.is_stale(now, stale_time),
            is_placeholder_data: false,
            data,
            error,
            refetch,
        };
    }

    if !options.is_enabled() {
        return QueryResult::idle(refetch);
    }

    match placeholder() {
        Some(value) => QueryResult {
            data: memo.project(selector, Some(&value)),
            error: None,
            is_loading: false,
            is_fetching: true,
            is_error: false,
            is_success: true,
            is_stale: true,
            is_placeholder_data: true,
            refetch,
        },
        None => QueryResult {
            refetch,
            ..QueryResult::loading()
        },
    }
}
