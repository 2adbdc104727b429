// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Query options and how changes to them are classified.

use std::{
    fmt::{self, Debug, Formatter},
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{
    CanonicalKey, QueryError, QueryKey,
    fetch::{Headers, Params, Schema},
};

/// A query function: produces the payload for a key directly, without a fetcher.
pub type QueryFn = Arc<dyn Fn(QueryContext) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// Derives a placeholder payload from a related cached entry.
pub type PlaceholderFn = Arc<dyn Fn(&PlaceholderCandidate) -> Option<Value> + Send + Sync>;

type UrlFn = Arc<dyn Fn(&Params) -> String + Send + Sync>;
type SelectFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// What a query function receives when invoked.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct QueryContext {
    /// The key being fetched.
    pub key: QueryKey,
    /// The query parameters.
    pub params: Params,
    /// Cancelled when the client shuts down.
    pub cancellation: CancellationToken,
}

/// A cached entry offered to a placeholder function.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PlaceholderCandidate {
    /// The key of the related entry.
    pub key: CanonicalKey,
    /// Its cached payload.
    pub data: Arc<Value>,
    /// When it was last written.
    pub updated_at: u64,
}

#[derive(Clone)]
pub(crate) enum QuerySource {
    Url(String),
    UrlBuilder(UrlFn),
    Function(QueryFn),
}

#[derive(Clone)]
pub(crate) enum Placeholder {
    Value(Arc<Value>),
    Derive(PlaceholderFn),
}

#[derive(Clone)]
pub(crate) struct Selector {
    pub(crate) func: SelectFn,
    pub(crate) deps: Option<Vec<Value>>,
}

/// Describes a single query: what key it caches under, where its data comes from and
/// how its result is shaped.
///
/// Create options with [`QueryOptions::builder`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use quarry::{QueryOptions, query_key};
/// use serde_json::json;
///
/// let options = QueryOptions::builder(query_key!["user", 1])
///     .url("/api/users/1")
///     .param("expand", json!(true))
///     .stale_time(Duration::from_secs(30))
///     .build()?;
///
/// assert!(options.is_enabled());
/// assert_eq!(options.stale_time(), Some(Duration::from_secs(30)));
/// # Ok::<(), quarry::QueryError>(())
/// ```
#[derive(Clone)]
pub struct QueryOptions {
    key: QueryKey,
    canonical: CanonicalKey,
    pub(crate) source: QuerySource,
    params: Params,
    headers: Headers,
    pub(crate) schema: Option<Arc<dyn Schema>>,
    enabled: bool,
    stale_time: Option<Duration>,
    gc_time: Option<Duration>,
    pub(crate) select: Option<Selector>,
    pub(crate) transform: Option<TransformFn>,
    pub(crate) placeholder: Option<Placeholder>,
}

impl QueryOptions {
    /// Starts building options for `key`.
    pub fn builder(key: impl Into<QueryKey>) -> QueryOptionsBuilder {
        QueryOptionsBuilder {
            key: key.into(),
            source: None,
            sources_set: 0,
            params: Params::new(),
            headers: Headers::new(),
            schema: None,
            enabled: true,
            stale_time: None,
            gc_time: None,
            select: None,
            transform: None,
            placeholder: None,
        }
    }

    /// Returns the query key.
    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Returns the canonical form of the query key.
    #[must_use]
    pub fn canonical_key(&self) -> &CanonicalKey {
        &self.canonical
    }

    /// Returns the query parameters.
    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the request headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns `false` if the query must not fetch.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the stale time, or `None` to use the client default.
    #[must_use]
    pub fn stale_time(&self) -> Option<Duration> {
        self.stale_time
    }

    /// Returns the eviction grace period, or `None` to use the client default.
    #[must_use]
    pub fn gc_time(&self) -> Option<Duration> {
        self.gc_time
    }

    /// Returns a copy of these options with `enabled` replaced.
    #[must_use]
    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self { enabled, ..self.clone() }
    }

    /// Returns `true` if the query is fetched through the client's fetcher.
    #[must_use]
    pub fn uses_fetcher(&self) -> bool {
        !matches!(self.source, QuerySource::Function(_))
    }

    /// Resolves the request URL, or `None` for function-based queries.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        match &self.source {
            QuerySource::Url(url) => Some(url.clone()),
            QuerySource::UrlBuilder(build) => Some(build(&self.params)),
            QuerySource::Function(_) => None,
        }
    }

    /// Hashes every option that is not a function.
    ///
    /// Function-valued options are represented only by their presence; the projection's
    /// declared dependencies are hashed by value.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();

        self.canonical.hash(&mut hasher);
        match &self.source {
            QuerySource::Url(url) => ("url", url.as_str()).hash(&mut hasher),
            QuerySource::UrlBuilder(build) => ("url_with", build(&self.params)).hash(&mut hasher),
            QuerySource::Function(_) => "fn".hash(&mut hasher),
        }
        Value::Object(self.params.clone()).to_string().hash(&mut hasher);
        self.headers.hash(&mut hasher);
        self.schema.is_some().hash(&mut hasher);
        self.enabled.hash(&mut hasher);
        self.stale_time.hash(&mut hasher);
        self.gc_time.hash(&mut hasher);
        self.transform.is_some().hash(&mut hasher);

        match &self.select {
            Some(selector) => ("select", selector.deps.as_ref().map(|deps| Value::Array(deps.clone()).to_string())).hash(&mut hasher),
            None => "no_select".hash(&mut hasher),
        }

        match &self.placeholder {
            Some(Placeholder::Value(value)) => ("placeholder", value.to_string()).hash(&mut hasher),
            Some(Placeholder::Derive(_)) => "placeholder_fn".hash(&mut hasher),
            None => "no_placeholder".hash(&mut hasher),
        }

        hasher.finish()
    }
}

impl Debug for QueryOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.canonical)
            .field("url", &self.url())
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .finish_non_exhaustive()
    }
}

/// Builder for [`QueryOptions`].
#[must_use]
pub struct QueryOptionsBuilder {
    key: QueryKey,
    source: Option<QuerySource>,
    sources_set: usize,
    params: Params,
    headers: Headers,
    schema: Option<Arc<dyn Schema>>,
    enabled: bool,
    stale_time: Option<Duration>,
    gc_time: Option<Duration>,
    select: Option<Selector>,
    transform: Option<TransformFn>,
    placeholder: Option<Placeholder>,
}

impl Debug for QueryOptionsBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptionsBuilder").field("key", &self.key).finish_non_exhaustive()
    }
}

impl QueryOptionsBuilder {
    fn with_source(mut self, source: QuerySource) -> Self {
        self.source = Some(source);
        self.sources_set += 1;
        self
    }

    /// Fetches from a fixed URL through the client's fetcher.
    ///
    /// A query has exactly one source: combining this with [`url_with`](Self::url_with)
    /// or [`query_fn`](Self::query_fn) fails at [`build`](Self::build).
    pub fn url(self, url: impl Into<String>) -> Self {
        self.with_source(QuerySource::Url(url.into()))
    }

    /// Fetches from a URL computed from the query parameters.
    pub fn url_with(self, build: impl Fn(&Params) -> String + Send + Sync + 'static) -> Self {
        self.with_source(QuerySource::UrlBuilder(Arc::new(build)))
    }

    /// Produces data by calling `query` instead of a fetcher.
    ///
    /// ```
    /// use quarry::{QueryOptions, query_key};
    /// use serde_json::json;
    ///
    /// let options = QueryOptions::builder(query_key!["answer"])
    ///     .query_fn(|_context| async { Ok(json!(42)) })
    ///     .build()?;
    /// assert!(!options.uses_fetcher());
    /// # Ok::<(), quarry::QueryError>(())
    /// ```
    pub fn query_fn<F, Fut>(self, query: F) -> Self
    where
        F: Fn(QueryContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        let query: QueryFn = Arc::new(move |context: QueryContext| query(context).boxed());
        self.with_source(QuerySource::Function(query))
    }

    /// Replaces all query parameters.
    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Adds a single query parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Adds a request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Validates every fetched payload against `schema`.
    pub fn schema(mut self, schema: impl Schema) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    /// Enables or disables fetching. Disabled queries only read the cache.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets how long fetched data stays fresh.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Sets how long an unobserved entry is kept before eviction.
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    /// Projects the cached payload for this observer.
    ///
    /// The projection is recomputed whenever its function or the cached payload changes.
    pub fn select(mut self, select: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.select = Some(Selector {
            func: Arc::new(select),
            deps: None,
        });
        self
    }

    /// Projects the cached payload, recomputing only when `deps` or the payload change.
    pub fn select_with_deps(mut self, select: impl Fn(&Value) -> Value + Send + Sync + 'static, deps: Vec<Value>) -> Self {
        self.select = Some(Selector {
            func: Arc::new(select),
            deps: Some(deps),
        });
        self
    }

    /// Rewrites each fetched payload before it is stored.
    pub fn transform(mut self, transform: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Shows `data` while the first fetch is in flight.
    pub fn placeholder_data(mut self, data: Value) -> Self {
        self.placeholder = Some(Placeholder::Value(Arc::new(data)));
        self
    }

    /// Derives placeholder data from the most recently updated entry that shares this
    /// key's leading segment.
    pub fn placeholder_fn(mut self, derive: impl Fn(&PlaceholderCandidate) -> Option<Value> + Send + Sync + 'static) -> Self {
        self.placeholder = Some(Placeholder::Derive(Arc::new(derive)));
        self
    }

    /// Creates the options.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the key is empty, or unless exactly one URL or
    /// query function was set.
    pub fn build(self) -> Result<QueryOptions, QueryError> {
        let empty_key = match &self.key {
            QueryKey::Text(text) => text.is_empty(),
            QueryKey::Segments(segments) => segments.is_empty(),
        };
        if empty_key {
            return Err(QueryError::configuration("query keys must not be empty"));
        }

        if self.sources_set > 1 {
            return Err(QueryError::configuration(format!(
                "query {} sets more than one of url, url_with and query_fn",
                self.key
            )));
        }

        let Some(source) = self.source else {
            return Err(QueryError::configuration(format!(
                "query {} has neither a url nor a query function",
                self.key
            )));
        };

        Ok(QueryOptions {
            canonical: self.key.canonical(),
            key: self.key,
            source,
            params: self.params,
            headers: self.headers,
            schema: self.schema,
            enabled: self.enabled,
            stale_time: self.stale_time,
            gc_time: self.gc_time,
            select: self.select,
            transform: self.transform,
            placeholder: self.placeholder,
        })
    }
}

/// How new options differ from the current ones.
#[derive(Debug)]
pub(crate) enum OptionsChange {
    /// Every hashed option is the same.
    Unchanged,
    /// Same key, different options.
    Updated,
    /// The key changed; carries the options being replaced.
    KeyChanged(QueryOptions),
}

/// Holds an observer's current options and classifies replacements.
#[derive(Debug)]
pub(crate) struct OptionsManager {
    current: QueryOptions,
    hash: u64,
}

impl OptionsManager {
    pub(crate) fn new(options: QueryOptions) -> Self {
        Self {
            hash: options.content_hash(),
            current: options,
        }
    }

    pub(crate) fn current(&self) -> &QueryOptions {
        &self.current
    }

    /// Installs `next` and reports how it differs from the options it replaced.
    pub(crate) fn apply(&mut self, next: QueryOptions) -> OptionsChange {
        let hash = next.content_hash();
        let previous = std::mem::replace(&mut self.current, next);
        let previous_hash = std::mem::replace(&mut self.hash, hash);

        if previous.canonical_key() != self.current.canonical_key() {
            OptionsChange::KeyChanged(previous)
        } else if previous_hash == hash {
            OptionsChange::Unchanged
        } else {
            OptionsChange::Updated
        }
    }
}
