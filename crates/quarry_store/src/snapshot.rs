// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Serializable store snapshots.

use std::collections::{BTreeMap, btree_map};

use serde::{Deserialize, Serialize};

use crate::{CanonicalKey, QueryError, QueryState};

/// A serializable copy of the entries in a store.
///
/// The wire format is a JSON object mapping canonical keys to
/// `{ "data", "isLoading", "isFetching", "updatedAt" }`. Errors are never included.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use quarry_store::{QueryState, Snapshot, query_key};
/// use serde_json::json;
///
/// let mut snapshot = Snapshot::default();
/// snapshot.insert(query_key!["user", 1].canonical(), QueryState::success(Arc::new(json!("Ada")), 7));
///
/// let text = snapshot.to_json()?;
/// assert_eq!(text, r#"{"[\"user\",1]":{"data":"Ada","isLoading":false,"isFetching":false,"updatedAt":7}}"#);
/// assert_eq!(Snapshot::from_json(&text)?, snapshot);
/// # Ok::<(), quarry_store::QueryError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<CanonicalKey, QueryState>,
}

impl Snapshot {
    /// Adds or replaces an entry.
    pub fn insert(&mut self, key: CanonicalKey, state: QueryState) -> Option<QueryState> {
        self.entries.insert(key, state)
    }

    /// Returns the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &CanonicalKey) -> Option<&QueryState> {
        self.entries.get(key)
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the snapshot holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, CanonicalKey, QueryState> {
        self.entries.iter()
    }

    /// Encodes the snapshot as JSON.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if encoding fails.
    pub fn to_json(&self) -> Result<String, QueryError> {
        serde_json::to_string(self).map_err(QueryError::configuration)
    }

    /// Decodes a snapshot from JSON.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `text` is not a valid snapshot.
    pub fn from_json(text: &str) -> Result<Self, QueryError> {
        serde_json::from_str(text).map_err(QueryError::validation)
    }
}

impl FromIterator<(CanonicalKey, QueryState)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (CanonicalKey, QueryState)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Snapshot {
    type Item = (CanonicalKey, QueryState);
    type IntoIter = btree_map::IntoIter<CanonicalKey, QueryState>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = (&'a CanonicalKey, &'a QueryState);
    type IntoIter = btree_map::Iter<'a, CanonicalKey, QueryState>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
