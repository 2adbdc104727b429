// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Query telemetry: structured `tracing` events and OpenTelemetry metrics.
//!
//! Every notable step of a query's life is recorded as an operation and an activity.
//! Logs carry the canonical key; metrics do not, to keep their cardinality bounded.

use std::{sync::Arc, time::Duration};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Gauge, Histogram, Meter},
};

use crate::CanonicalKey;

pub(crate) mod attributes;
pub(crate) mod metrics;
#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryOperation {
    Fetch,
    Invalidate,
    Remove,
    Evict,
    Hydrate,
    Dehydrate,
    Clear,
}

impl QueryOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "query.fetch",
            Self::Invalidate => "query.invalidate",
            Self::Remove => "query.remove",
            Self::Evict => "query.evict",
            Self::Hydrate => "query.hydrate",
            Self::Dehydrate => "query.dehydrate",
            Self::Clear => "query.clear",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryActivity {
    FetchStarted,
    FetchSucceeded,
    FetchFailed,
    FetchSkippedFresh,
    FetchDeduplicated,
    Invalidated,
    Removed,
    EvictedGc,
    EvictedCapacity,
    Hydrated,
    Dehydrated,
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Debug,
    Info,
    Error,
}

impl QueryActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FetchStarted => "query.fetch_started",
            Self::FetchSucceeded => "query.fetch_succeeded",
            Self::FetchFailed => "query.fetch_failed",
            Self::FetchSkippedFresh => "query.fetch_skipped_fresh",
            Self::FetchDeduplicated => "query.fetch_deduplicated",
            Self::Invalidated => "query.invalidated",
            Self::Removed => "query.removed",
            Self::EvictedGc => "query.evicted_gc",
            Self::EvictedCapacity => "query.evicted_capacity",
            Self::Hydrated => "query.hydrated",
            Self::Dehydrated => "query.dehydrated",
            Self::Cleared => "query.cleared",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::FetchStarted | Self::FetchSucceeded | Self::FetchSkippedFresh | Self::FetchDeduplicated | Self::EvictedGc | Self::Dehydrated => {
                Severity::Debug
            }
            Self::Invalidated | Self::Removed | Self::EvictedCapacity | Self::Hydrated | Self::Cleared => Severity::Info,
            Self::FetchFailed => Severity::Error,
        }
    }
}

/// Records query events as logs and metrics.
#[derive(Clone, Debug)]
pub(crate) struct QueryTelemetry {
    inner: Arc<QueryTelemetryInner>,
}

#[derive(Debug)]
struct QueryTelemetryInner {
    logging_enabled: bool,
    event_counter: Option<Counter<u64>>,
    fetch_duration: Option<Histogram<f64>>,
    store_size: Option<Gauge<u64>>,
}

impl QueryTelemetry {
    pub fn new(logging_enabled: bool, meter: Option<&Meter>) -> Self {
        Self {
            inner: Arc::new(QueryTelemetryInner {
                logging_enabled,
                event_counter: meter.map(metrics::create_event_counter),
                fetch_duration: meter.map(metrics::create_fetch_duration_histogram),
                store_size: meter.map(metrics::create_store_size_gauge),
            }),
        }
    }

    /// A collector that records nothing.
    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::new(false, None)
    }

    pub fn record(
        &self,
        client: &'static str,
        operation: QueryOperation,
        activity: QueryActivity,
        key: Option<&CanonicalKey>,
        duration: Option<Duration>,
    ) {
        let attrs = [
            KeyValue::new(attributes::QUERY_CLIENT_NAME, client),
            KeyValue::new(attributes::QUERY_OPERATION_NAME, operation.as_str()),
            KeyValue::new(attributes::QUERY_ACTIVITY_NAME, activity.as_str()),
        ];

        if let Some(counter) = &self.inner.event_counter {
            counter.add(1, &attrs);
        }

        if let (Some(d), Some(h)) = (duration, &self.inner.fetch_duration) {
            h.record(d.as_secs_f64(), &attrs);
        }

        if self.inner.logging_enabled {
            Self::emit(client, operation, activity, key, duration);
        }
    }

    pub fn record_size(&self, client: &'static str, size: usize) {
        if let Some(gauge) = &self.inner.store_size {
            gauge.record(
                u64::try_from(size).unwrap_or(u64::MAX),
                &[KeyValue::new(attributes::QUERY_CLIENT_NAME, client)],
            );
        }
    }

    fn emit(client: &'static str, operation: QueryOperation, activity: QueryActivity, key: Option<&CanonicalKey>, duration: Option<Duration>) {
        let op = operation.as_str();
        let act = activity.as_str();
        let key = key.map_or("", CanonicalKey::as_str);
        let duration_ns = duration.map(|d| d.as_nanos());

        // Field names must match the constants in attributes.rs.
        macro_rules! emit_event {
            ($level:ident) => {
                tracing::$level!(
                    query.client = client,
                    query.operation = op,
                    query.activity = act,
                    query.key = key,
                    query.duration_ns = ?duration_ns,
                    "query.event"
                )
            };
        }

        match activity.severity() {
            Severity::Error => emit_event!(error),
            Severity::Info => emit_event!(info),
            Severity::Debug => emit_event!(debug),
        }
    }
}
