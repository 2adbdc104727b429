// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

pub(crate) const QUERY_CLIENT_NAME: &str = "query.client";

pub(crate) const QUERY_OPERATION_NAME: &str = "query.operation";

pub(crate) const QUERY_ACTIVITY_NAME: &str = "query.activity";

#[cfg(test)]
pub(crate) const QUERY_KEY_NAME: &str = "query.key";

#[cfg(test)]
pub(crate) const QUERY_DURATION_NAME: &str = "query.duration_ns";

#[cfg(test)]
pub(crate) const QUERY_EVENT_NAME: &str = "query.event";
