// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Query keys and their canonical string form.
//!
//! A [`QueryKey`] is either a plain string or an ordered list of JSON segments. Every key is
//! reduced to a [`CanonicalKey`] before it touches the store: segment keys are rendered as
//! compact JSON with object members kept in insertion order, string keys are used verbatim.
//! Two keys that render to the same canonical string address the same cache entry.

use std::{
    borrow::Borrow,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies a query in the cache.
///
/// # Examples
///
/// ```
/// use quarry_store::{QueryKey, query_key};
///
/// let by_segments = query_key!["user", 42];
/// assert_eq!(by_segments.canonical().as_str(), r#"["user",42]"#);
///
/// let by_text = QueryKey::from("settings");
/// assert_eq!(by_text.canonical().as_str(), "settings");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKey {
    /// A single string key, canonicalized verbatim.
    Text(String),
    /// An ordered list of JSON segments, canonicalized as a compact JSON array.
    Segments(Vec<Value>),
}

impl QueryKey {
    /// Creates a segment key from anything convertible to JSON values.
    pub fn segments<I, V>(segments: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::Segments(segments.into_iter().map(Into::into).collect())
    }

    /// Renders this key to its canonical form.
    #[must_use]
    pub fn canonical(&self) -> CanonicalKey {
        match self {
            Self::Text(text) => CanonicalKey(Arc::from(text.as_str())),
            Self::Segments(segments) => CanonicalKey(Arc::from(render_segments(segments))),
        }
    }

    /// Returns the leading segment used to find related entries.
    ///
    /// Text keys have no segments, so the whole string acts as the discriminator.
    #[must_use]
    pub fn discriminator(&self) -> Option<Value> {
        match self {
            Self::Text(text) => Some(Value::String(text.clone())),
            Self::Segments(segments) => segments.first().cloned(),
        }
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(value: Vec<Value>) -> Self {
        Self::Segments(value)
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical().as_str())
    }
}

fn render_segments(segments: &[Value]) -> String {
    // Serializing a `Value` into a string buffer cannot fail.
    serde_json::to_string(segments).unwrap_or_default()
}

/// The canonical string form of a [`QueryKey`], used as the store's map key.
///
/// Cloning is cheap; the string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(Arc<str>);

impl CanonicalKey {
    /// Returns the canonical string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the canonical string back into segments.
    ///
    /// Returns `None` for keys that are not a JSON array, which includes all text keys.
    #[must_use]
    pub fn segments(&self) -> Option<Vec<Value>> {
        if !self.0.starts_with('[') {
            return None;
        }

        match serde_json::from_str::<Value>(&self.0) {
            Ok(Value::Array(segments)) => Some(segments),
            _ => None,
        }
    }

    /// Returns the leading segment of this key, or the whole string for text keys.
    #[must_use]
    pub fn discriminator(&self) -> Option<Value> {
        match self.segments() {
            Some(segments) => segments.into_iter().next(),
            None => Some(Value::String(self.0.to_string())),
        }
    }
}

impl From<&QueryKey> for CanonicalKey {
    fn from(key: &QueryKey) -> Self {
        key.canonical()
    }
}

impl From<QueryKey> for CanonicalKey {
    fn from(key: QueryKey) -> Self {
        key.canonical()
    }
}

impl From<&str> for CanonicalKey {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl Borrow<str> for CanonicalKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for CanonicalKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selects a group of cache entries by key prefix.
///
/// A segment prefix matches every segment key whose leading segments equal it; the empty
/// prefix matches every key. A text prefix matches every canonical key that starts with it.
///
/// # Examples
///
/// ```
/// use quarry_store::{KeyPrefix, query_key};
///
/// let prefix = KeyPrefix::from(query_key!["user"]);
/// assert!(prefix.matches(&query_key!["user", 1].canonical()));
/// assert!(!prefix.matches(&query_key!["post", 1].canonical()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPrefix {
    /// Matches keys whose canonical string starts with this text.
    Text(String),
    /// Matches segment keys that begin with these segments.
    Segments(Vec<Value>),
}

impl KeyPrefix {
    /// A prefix that matches every key.
    #[must_use]
    pub fn all() -> Self {
        Self::Segments(Vec::new())
    }

    /// Returns `true` if `key` falls under this prefix.
    #[must_use]
    pub fn matches(&self, key: &CanonicalKey) -> bool {
        match self {
            Self::Text(prefix) => key.as_str().starts_with(prefix.as_str()),
            Self::Segments(prefix) if prefix.is_empty() => true,
            Self::Segments(prefix) => key
                .segments()
                .is_some_and(|segments| segments.len() >= prefix.len() && segments.iter().zip(prefix).all(|(a, b)| a == b)),
        }
    }
}

impl From<QueryKey> for KeyPrefix {
    fn from(key: QueryKey) -> Self {
        match key {
            QueryKey::Text(text) => Self::Text(text),
            QueryKey::Segments(segments) => Self::Segments(segments),
        }
    }
}

impl From<&QueryKey> for KeyPrefix {
    fn from(key: &QueryKey) -> Self {
        key.clone().into()
    }
}

impl From<&str> for KeyPrefix {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

/// Builds a segment [`QueryKey`] from a list of JSON-convertible expressions.
///
/// Each segment accepts anything the [`serde_json::json!`] macro accepts.
///
/// ```
/// use quarry_store::query_key;
///
/// let key = query_key!["todos", { "status": "done", "page": 2 }];
/// assert_eq!(key.canonical().as_str(), r#"["todos",{"status":"done","page":2}]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:tt),* $(,)?) => {
        $crate::QueryKey::Segments(::std::vec![$($crate::__private::json!($segment)),*])
    };
}
