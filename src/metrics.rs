/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

const NAMESPACE: &str = "gameserver_operator";

pub(crate) fn registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
    &REGISTRY
}

/// Builds a counter and registers it. Every metric below lives behind a
/// `Lazy`, so this runs exactly once per metric and a registration failure
/// is a naming bug, not a runtime condition.
fn counter(name: &str, subsystem: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(
        Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem),
    )
    .unwrap();
    registry()
        .register(Box::new(counter.clone()))
        .expect("metric name collision");
    counter
}

fn counter_vec(name: &str, subsystem: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counters = IntCounterVec::new(
        Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem),
        labels,
    )
    .unwrap();
    registry()
        .register(Box::new(counters.clone()))
        .expect("metric name collision");
    counters
}

pub(crate) fn reconciles_total(controller: &str) -> IntCounter {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        counter_vec(
            "reconciles_total",
            "controller",
            "Total number of completed reconcile passes.",
            &["controller"],
        )
    });
    METRIC.with_label_values(&[controller])
}

pub(crate) fn reconcile_errors_total(controller: &str) -> IntCounter {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        counter_vec(
            "reconcile_errors_total",
            "controller",
            "Total number of reconcile passes that returned an error.",
            &["controller"],
        )
    });
    METRIC.with_label_values(&[controller])
}

pub(crate) fn instances_created_total() -> &'static IntCounter {
    static METRIC: Lazy<IntCounter> = Lazy::new(|| {
        counter(
            "instances_created_total",
            "fleet",
            "Game-server instances created by the fleet controller.",
        )
    });
    &METRIC
}

pub(crate) fn instances_deleted_total() -> &'static IntCounter {
    static METRIC: Lazy<IntCounter> = Lazy::new(|| {
        counter(
            "instances_deleted_total",
            "fleet",
            "Game-server instances deleted by the fleet controller.",
        )
    });
    &METRIC
}

pub(crate) fn poll_failures_total() -> &'static IntCounter {
    static METRIC: Lazy<IntCounter> = Lazy::new(|| {
        counter(
            "poll_failures_total",
            "instance",
            "Status polls that ended in a transport, HTTP, or decode error.",
        )
    });
    &METRIC
}
