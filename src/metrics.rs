/*
 * Copyright 2025 Google LLC All Rights Reserved.
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
use prometheus::core::Collector;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    DEFAULT_BUCKETS,
};

pub fn registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);
    &REGISTRY
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace("billet")
        .subsystem(subsystem)
}

pub fn histogram_opts(name: &str, subsystem: &str, description: &str) -> HistogramOpts {
    HistogramOpts {
        common_opts: opts(name, subsystem, description),
        buckets: Vec::from(DEFAULT_BUCKETS as &'static [f64]),
    }
}

pub fn register<T: Collector + Clone + 'static>(collector: T) -> T {
    registry()
        .register(Box::new(collector.clone()))
        .map(|()| collector)
        .unwrap()
}

pub(crate) fn cache_events_total(kind: &str) -> IntCounter {
    static EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "events_total",
                    "cache",
                    "Total number of change feed events applied to the allocation cache.",
                ),
                &["kind"],
            )
            .unwrap(),
        )
    });

    EVENTS.with_label_values(&[kind])
}

pub(crate) fn allocations_total(result: &str) -> IntCounter {
    static ALLOCATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "requests_total",
                    "allocation",
                    "Total number of allocation requests by result.",
                ),
                &["result"],
            )
            .unwrap(),
        )
    });

    ALLOCATIONS.with_label_values(&[result])
}

pub(crate) fn allocation_conflicts_total() -> &'static IntCounter {
    static CONFLICTS: Lazy<IntCounter> = Lazy::new(|| {
        register(
            IntCounter::with_opts(opts(
                "conflicts_total",
                "allocation",
                "Number of allocation commits lost to a concurrent requester.",
            ))
            .unwrap(),
        )
    });

    &CONFLICTS
}

pub(crate) fn overflow_unresolved_total(set: &str) -> IntCounter {
    static UNRESOLVED: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "overflow_unresolved_total",
                    "reconcile",
                    "Reconcile passes that found more allocated servers than desired \
                     replicas with no overflow policy configured.",
                ),
                &["set"],
            )
            .unwrap(),
        )
    });

    UNRESOLVED.with_label_values(&[set])
}

pub(crate) fn overflow_marked_total() -> &'static IntCounter {
    static MARKED: Lazy<IntCounter> = Lazy::new(|| {
        register(
            IntCounter::with_opts(opts(
                "overflow_marked_total",
                "reconcile",
                "Allocated servers marked with the overflow policy's labels and annotations.",
            ))
            .unwrap(),
        )
    });

    &MARKED
}

pub(crate) fn reconcile_duration_seconds() -> &'static Histogram {
    static DURATION: Lazy<Histogram> = Lazy::new(|| {
        register(
            Histogram::with_opts(histogram_opts(
                "duration_seconds",
                "reconcile",
                "Duration of a full reconciliation pass over all sets.",
            ))
            .unwrap(),
        )
    });

    &DURATION
}

pub(crate) fn gameservers(set: &str, state: &str) -> IntGauge {
    static GAMESERVERS: Lazy<IntGaugeVec> = Lazy::new(|| {
        register(
            IntGaugeVec::new(
                opts(
                    "gameservers",
                    "reconcile",
                    "Number of game servers per set and lifecycle bucket.",
                ),
                &["set", "state"],
            )
            .unwrap(),
        )
    });

    GAMESERVERS.with_label_values(&[set, state])
}

pub(crate) fn shutdown_initiated() -> &'static IntGauge {
    static SHUTDOWN: Lazy<IntGauge> = Lazy::new(|| {
        register(
            IntGauge::with_opts(opts(
                "shutdown_initiated",
                "global",
                "Whether the process has received a shutdown signal.",
            ))
            .unwrap(),
        )
    });

    &SHUTDOWN
}
