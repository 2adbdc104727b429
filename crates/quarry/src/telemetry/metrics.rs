// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use opentelemetry::{
    InstrumentationScope,
    metrics::{Counter, Gauge, Histogram, Meter, MeterProvider},
};

const METER_NAME: &str = "quarry";
const VERSION: &str = "v0.1.0";
const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.47.0";
const QUERY_EVENT_COUNT_NAME: &str = "query.event.count";
const QUERY_FETCH_DURATION_NAME: &str = "query.fetch.duration";
const QUERY_STORE_SIZE_NAME: &str = "query.store.size";

pub(crate) fn create_meter(meter_provider: &dyn MeterProvider) -> Meter {
    meter_provider.meter_with_scope(
        InstrumentationScope::builder(METER_NAME)
            .with_version(VERSION)
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
}

pub(crate) fn create_event_counter(meter: &Meter) -> Counter<u64> {
    meter
        .u64_counter(QUERY_EVENT_COUNT_NAME)
        .with_description("Query events")
        .with_unit("{event}")
        .build()
}

pub(crate) fn create_fetch_duration_histogram(meter: &Meter) -> Histogram<f64> {
    meter
        .f64_histogram(QUERY_FETCH_DURATION_NAME)
        .with_description("Duration of query fetches")
        .with_unit("s")
        .build()
}

pub(crate) fn create_store_size_gauge(meter: &Meter) -> Gauge<u64> {
    meter
        .u64_gauge(QUERY_STORE_SIZE_NAME)
        .with_description("Number of entries in the query store")
        .with_unit("{entry}")
        .build()
}
