// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Builder for [`QueryClient`].

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    sync::Arc,
    time::Duration,
};

use anyspawn::Spawner;
use opentelemetry::metrics::MeterProvider;
use parking_lot::Mutex;
use quarry_store::{DEFAULT_CAPACITY, EvictionCause, QueryStore};
use tick::Clock;
use tokio_util::sync::CancellationToken;

use crate::{
    QueryClient,
    client::{ClientInner, ClientName},
    fetch::Fetcher,
    telemetry::{QueryActivity, QueryOperation, QueryTelemetry, metrics},
};

/// The default eviction grace period for unobserved entries.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Builder for creating a [`QueryClient`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use anyspawn::Spawner;
/// use quarry::QueryClient;
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = QueryClient::builder(Clock::new_tokio(), Spawner::new_tokio())
///     .name("catalog")
///     .capacity(500)
///     .default_stale_time(Duration::from_secs(30))
///     .stampede_protection()
///     .logs()
///     .build();
///
/// assert_eq!(client.name(), "catalog");
/// assert_eq!(client.store().capacity(), 500);
/// # }
/// ```
#[must_use]
pub struct QueryClientBuilder {
    name: ClientName,
    clock: Clock,
    spawner: Spawner,
    capacity: usize,
    default_stale_time: Duration,
    default_gc_time: Duration,
    fetcher: Option<Arc<dyn Fetcher>>,
    stampede_protection: bool,
    logs: bool,
    meter: Option<opentelemetry::metrics::Meter>,
}

impl QueryClientBuilder {
    pub(crate) fn new(clock: Clock, spawner: Spawner) -> Self {
        Self {
            name: "default",
            clock,
            spawner,
            capacity: DEFAULT_CAPACITY,
            default_stale_time: Duration::ZERO,
            default_gc_time: DEFAULT_GC_TIME,
            fetcher: None,
            stampede_protection: false,
            logs: false,
            meter: None,
        }
    }

    /// Sets the name reported in logs and metrics.
    pub fn name(mut self, name: ClientName) -> Self {
        self.name = name;
        self
    }

    /// Sets the maximum number of cached entries.
    ///
    /// When full, writing a new key evicts the least recently written entry even if it
    /// is observed.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the stale time for options that do not set their own. Defaults to zero, so
    /// data is stale as soon as it is written.
    pub fn default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    /// Sets the eviction grace period for options that do not set their own. Defaults to
    /// [`DEFAULT_GC_TIME`].
    pub fn default_gc_time(mut self, gc_time: Duration) -> Self {
        self.default_gc_time = gc_time;
        self
    }

    /// Sets the fetcher that serves URL-based queries.
    pub fn fetcher(mut self, fetcher: impl Fetcher) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Enables stampede protection.
    ///
    /// While a fetch for a key is in flight, further fetches for that key are skipped
    /// and callers of [`QueryClient::fetch_query`] wait for the running one. Without it,
    /// every observer decides on its own and concurrent fetches race to write.
    pub fn stampede_protection(mut self) -> Self {
        self.stampede_protection = true;
        self
    }

    /// Emits a `tracing` event for every query activity.
    pub fn logs(mut self) -> Self {
        self.logs = true;
        self
    }

    /// Records query metrics with a meter from `provider`.
    pub fn metrics(mut self, provider: &dyn MeterProvider) -> Self {
        self.meter = Some(metrics::create_meter(provider));
        self
    }

    /// Builds the client.
    pub fn build(self) -> QueryClient {
        let telemetry = QueryTelemetry::new(self.logs, self.meter.as_ref());
        let name = self.name;

        let on_evict = telemetry.clone();
        let store = QueryStore::builder(self.clock, self.spawner)
            .capacity(self.capacity)
            .on_evict(move |key, cause| {
                let activity = match cause {
                    EvictionCause::Expired => QueryActivity::EvictedGc,
                    EvictionCause::Capacity => QueryActivity::EvictedCapacity,
                };
                on_evict.record(name, QueryOperation::Evict, activity, Some(key), None);
            })
            .build();

        QueryClient::from_inner(ClientInner {
            name,
            store,
            fetcher: self.fetcher,
            default_stale_time: self.default_stale_time,
            default_gc_time: self.default_gc_time,
            stampede_protection: self.stampede_protection,
            in_flight: Mutex::new(HashMap::new()),
            telemetry,
            cancellation: Mutex::new(CancellationToken::new()),
        })
    }
}

impl Debug for QueryClientBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClientBuilder")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("default_stale_time", &self.default_stale_time)
            .field("default_gc_time", &self.default_gc_time)
            .field("fetcher", &self.fetcher)
            .field("stampede_protection", &self.stampede_protection)
            .field("logs", &self.logs)
            .field("metrics", &self.meter.is_some())
            .finish_non_exhaustive()
    }
}
