// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Field-level change tracking and structural sharing for query results.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use bitflags::bitflags;
use serde_json::Value;

use crate::{QueryError, QueryResult};

bitflags! {
    /// The fields of a [`QueryResult`] a consumer depends on.
    ///
    /// An observer only notifies its subscribers when a tracked field changes. The empty
    /// set means nothing has been read yet, and every field counts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TrackedFields: u8 {
        /// The (projected) data.
        const DATA = 1;
        /// The error value.
        const ERROR = 1 << 1;
        /// `is_loading`.
        const IS_LOADING = 1 << 2;
        /// `is_fetching`.
        const IS_FETCHING = 1 << 3;
        /// `is_error`.
        const IS_ERROR = 1 << 4;
        /// `is_success`.
        const IS_SUCCESS = 1 << 5;
        /// `is_stale`.
        const IS_STALE = 1 << 6;
        /// `is_placeholder_data`.
        const IS_PLACEHOLDER_DATA = 1 << 7;
    }
}

impl TrackedFields {
    /// The fields whose changes should trigger a notification.
    #[must_use]
    pub fn interest(self) -> Self {
        if self.is_empty() { Self::all() } else { self }
    }
}

/// Accumulates the fields read through [`TrackedResult`]s.
#[derive(Debug, Clone, Default)]
pub(crate) struct FieldReads(Arc<AtomicU8>);

impl FieldReads {
    pub(crate) fn mark(&self, fields: TrackedFields) {
        self.0.fetch_or(fields.bits(), Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> TrackedFields {
        TrackedFields::from_bits_truncate(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// A [`QueryResult`] that records which fields are read.
///
/// Obtained from [`QueryObserver::tracked_result`](crate::QueryObserver::tracked_result).
/// Every accessor marks its field as tracked on the observer that produced the result.
#[derive(Debug, Clone)]
pub struct TrackedResult {
    result: QueryResult,
    reads: FieldReads,
}

impl TrackedResult {
    pub(crate) fn new(result: QueryResult, reads: FieldReads) -> Self {
        Self { result, reads }
    }

    /// Returns the data and tracks [`TrackedFields::DATA`].
    #[must_use]
    pub fn data(&self) -> Option<&Arc<Value>> {
        self.reads.mark(TrackedFields::DATA);
        self.result.data()
    }

    /// Returns the error and tracks [`TrackedFields::ERROR`].
    #[must_use]
    pub fn error(&self) -> Option<&Arc<QueryError>> {
        self.reads.mark(TrackedFields::ERROR);
        self.result.error()
    }

    /// Returns `is_loading` and tracks it.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.reads.mark(TrackedFields::IS_LOADING);
        self.result.is_loading()
    }

    /// Returns `is_fetching` and tracks it.
    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.reads.mark(TrackedFields::IS_FETCHING);
        self.result.is_fetching()
    }

    /// Returns `is_error` and tracks it.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.reads.mark(TrackedFields::IS_ERROR);
        self.result.is_error()
    }

    /// Returns `is_success` and tracks it.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reads.mark(TrackedFields::IS_SUCCESS);
        self.result.is_success()
    }

    /// Returns `is_stale` and tracks it.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.reads.mark(TrackedFields::IS_STALE);
        self.result.is_stale()
    }

    /// Returns `is_placeholder_data` and tracks it.
    #[must_use]
    pub fn is_placeholder_data(&self) -> bool {
        self.reads.mark(TrackedFields::IS_PLACEHOLDER_DATA);
        self.result.is_placeholder_data()
    }

    /// Returns the underlying result without tracking anything.
    #[must_use]
    pub fn untracked(&self) -> &QueryResult {
        &self.result
    }
}

fn same_data(a: Option<&Arc<Value>>, b: Option<&Arc<Value>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
        (None, None) => true,
        _ => false,
    }
}

fn same_error(a: Option<&Arc<QueryError>>, b: Option<&Arc<QueryError>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Returns the fields that differ between two results.
pub(crate) fn changed_fields(previous: &QueryResult, next: &QueryResult) -> TrackedFields {
    let mut changed = TrackedFields::empty();

    changed.set(TrackedFields::DATA, !same_data(previous.data(), next.data()));
    changed.set(TrackedFields::ERROR, !same_error(previous.error(), next.error()));
    changed.set(TrackedFields::IS_LOADING, previous.is_loading() != next.is_loading());
    changed.set(TrackedFields::IS_FETCHING, previous.is_fetching() != next.is_fetching());
    changed.set(TrackedFields::IS_ERROR, previous.is_error() != next.is_error());
    changed.set(TrackedFields::IS_SUCCESS, previous.is_success() != next.is_success());
    changed.set(TrackedFields::IS_STALE, previous.is_stale() != next.is_stale());
    changed.set(TrackedFields::IS_PLACEHOLDER_DATA, previous.is_placeholder_data() != next.is_placeholder_data());

    changed
}

/// Replaces parts of a freshly computed value with deeply equal parts of the previous one.
pub(crate) trait ShareStructure {
    #[must_use]
    fn share_from(self, previous: &Self) -> Self;
}

impl ShareStructure for Arc<Value> {
    fn share_from(self, previous: &Self) -> Self {
        if Arc::ptr_eq(&self, previous) || *self == **previous {
            Arc::clone(previous)
        } else {
            self
        }
    }
}

impl ShareStructure for Arc<QueryError> {
    fn share_from(self, previous: &Self) -> Self {
        if Arc::ptr_eq(&self, previous) { Arc::clone(previous) } else { self }
    }
}

impl<T: ShareStructure> ShareStructure for Option<T> {
    fn share_from(self, previous: &Self) -> Self {
        match (self, previous) {
            (Some(next), Some(previous)) => Some(next.share_from(previous)),
            (next, _) => next,
        }
    }
}

impl ShareStructure for QueryResult {
    fn share_from(mut self, previous: &Self) -> Self {
        self.data = self.data.take().share_from(&previous.data);
        self.error = self.error.take().share_from(&previous.error);
        self
    }
}
