// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The fetcher contract and schema validation.
//!
//! A [`Fetcher`] is the transport behind URL-based queries. The client hands it a
//! [`FetchRequest`] and expects a [`FetchResponse`] carrying a decoded JSON payload.
//! Transport failures and non-success statuses are reported as [`QueryError`]s of kind
//! [`Fetch`](quarry_store::ErrorKind::Fetch).

use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::QueryError;

/// Query parameters passed to the fetcher and to URL builders.
pub type Params = Map<String, Value>;

/// Request headers, ordered by name.
pub type Headers = BTreeMap<String, String>;

/// A request handed to a [`Fetcher`].
#[derive(Clone)]
#[non_exhaustive]
pub struct FetchRequest {
    /// The resolved URL.
    pub url: String,
    /// Query parameters.
    pub params: Params,
    /// Request headers.
    pub headers: Headers,
    /// Cancelled when the client shuts down; fetchers should stop work when it fires.
    pub cancellation: CancellationToken,
    /// The schema the payload will be validated against, if any.
    pub schema: Option<Arc<dyn Schema>>,
}

impl FetchRequest {
    /// Creates a request for `url` with no parameters or headers.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: Params::new(),
            headers: Headers::new(),
            cancellation: CancellationToken::new(),
            schema: None,
        }
    }
}

impl Debug for FetchRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("url", &self.url)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("schema", &self.schema.is_some())
            .finish()
    }
}

/// A decoded response returned by a [`Fetcher`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub struct FetchResponse {
    /// The decoded payload.
    pub data: Value,
    /// The transport status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
}

impl FetchResponse {
    /// A `200` response carrying `data` and no headers.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            status: 200,
            headers: Headers::new(),
        }
    }

    /// Replaces the status code.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Adds a response header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Performs the transport for URL-based queries.
///
/// Implementations must report transport failures and non-success statuses as errors,
/// typically built with [`QueryError::fetch`].
///
/// # Examples
///
/// ```
/// use futures::future::BoxFuture;
/// use quarry::{FetchRequest, FetchResponse, Fetcher, QueryError};
/// use serde_json::json;
///
/// #[derive(Debug)]
/// struct Echo;
///
/// impl Fetcher for Echo {
///     fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, QueryError>> {
///         Box::pin(async move { Ok(FetchResponse::ok(json!({ "url": request.url }))) })
///     }
/// }
///
/// let response = futures::executor::block_on(Echo.fetch(FetchRequest::new("/users/1")))?;
/// assert_eq!(response.data, json!({ "url": "/users/1" }));
/// # Ok::<(), QueryError>(())
/// ```
pub trait Fetcher: Debug + Send + Sync + 'static {
    /// Fetches `request`.
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'static, Result<FetchResponse, QueryError>>;
}

/// Validates and optionally coerces a fetched payload.
///
/// Closures of the form `Fn(Value) -> Result<Value, E>` implement this trait.
///
/// ```
/// use quarry::Schema;
/// use serde_json::{Value, json};
///
/// let requires_id = |value: Value| {
///     if value.get("id").is_some() { Ok(value) } else { Err("missing field `id`") }
/// };
///
/// assert!(requires_id.validate(json!({ "id": 1 })).is_ok());
/// assert!(requires_id.validate(json!({})).is_err());
/// ```
pub trait Schema: Send + Sync + 'static {
    /// Returns the accepted payload, or the reason it was rejected.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason when the payload does not conform.
    fn validate(&self, data: Value) -> Result<Value, Box<dyn StdError + Send + Sync>>;
}

impl<F, E> Schema for F
where
    F: Fn(Value) -> Result<Value, E> + Send + Sync + 'static,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn validate(&self, data: Value) -> Result<Value, Box<dyn StdError + Send + Sync>> {
        self(data).map_err(Into::into)
    }
}
