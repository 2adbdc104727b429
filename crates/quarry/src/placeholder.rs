// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provisional data shown before a query's first fetch settles.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    QueryStore,
    options::{Placeholder, PlaceholderCandidate, QueryOptions},
};

/// An observer's transient placeholder.
///
/// Shared with the fetches the observer starts so a settled fetch can clear it before
/// the real result is written.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlaceholderSlot(Arc<Mutex<Option<Arc<Value>>>>);

impl PlaceholderSlot {
    pub(crate) fn get(&self) -> Option<Arc<Value>> {
        self.0.lock().clone()
    }

    pub(crate) fn set(&self, value: Arc<Value>) {
        *self.0.lock() = Some(value);
    }

    pub(crate) fn clear(&self) {
        *self.0.lock() = None;
    }

    /// Returns the active placeholder, resolving and activating one if there is none.
    pub(crate) fn get_or_resolve(&self, store: &QueryStore, options: &QueryOptions) -> Option<Arc<Value>> {
        if let Some(active) = self.get() {
            return Some(active);
        }

        let value = resolve(store, options)?;
        self.set(Arc::clone(&value));
        Some(value)
    }
}

/// Computes a placeholder for a query that has nothing cached.
///
/// A static placeholder is returned as is. A placeholder function receives the most
/// recently updated entry that holds data, shares the query's discriminator and is not
/// the query's own entry; without such an entry there is no placeholder.
pub(crate) fn resolve(store: &QueryStore, options: &QueryOptions) -> Option<Arc<Value>> {
    match options.placeholder.as_ref()? {
        Placeholder::Value(value) => Some(Arc::clone(value)),
        Placeholder::Derive(derive) => {
            let own = options.canonical_key();
            let discriminator = options.key().discriminator()?;

            let (key, state) = store.find_latest(|key, state| {
                key != own && state.data.is_some() && key.discriminator().as_ref() == Some(&discriminator)
            })?;

            let candidate = PlaceholderCandidate {
                key,
                data: state.data?,
                updated_at: state.updated_at,
            };

            derive(&candidate).map(Arc::new)
        }
    }
}
