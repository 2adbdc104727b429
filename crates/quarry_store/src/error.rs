// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for query operations.

use std::fmt::{self, Display, Formatter};

/// The category of a [`QueryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The fetcher or query function failed, including transport and non-success statuses.
    Fetch,
    /// The fetched payload was rejected by the configured schema.
    Validation,
    /// The query was configured in a way that can never succeed.
    Configuration,
}

impl ErrorKind {
    /// Returns a short, stable name for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error produced while fetching, validating or configuring a query.
///
/// Errors stored in query state are shared behind an [`Arc`](std::sync::Arc), so every
/// observer of a failed key sees the same error instance. Use
/// [`std::error::Error::source()`] to reach the underlying cause.
///
/// # Examples
///
/// ```
/// use quarry_store::{ErrorKind, QueryError};
///
/// let error = QueryError::fetch("connection refused");
/// assert_eq!(error.kind(), ErrorKind::Fetch);
/// assert!(error.to_string().contains("connection refused"));
/// ```
#[ohno::error]
#[display("{kind} error")]
pub struct QueryError {
    kind: ErrorKind,
}

impl QueryError {
    /// Creates a fetch error wrapping the given cause.
    pub fn fetch(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(ErrorKind::Fetch, cause)
    }

    /// Creates a validation error wrapping the given cause.
    pub fn validation(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(ErrorKind::Validation, cause)
    }

    /// Creates a configuration error wrapping the given cause.
    pub fn configuration(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::caused_by(ErrorKind::Configuration, cause)
    }

    /// Returns the category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns `true` if the payload failed schema validation.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        self.kind == ErrorKind::Validation
    }
}

/// A specialized [`Result`] type for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;
