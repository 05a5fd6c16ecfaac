/*
 * Copyright 2026 Google LLC
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

//! Counter and gauge store keyed by dotted stat paths.
//!
//! Listener stats use hierarchical names (`listener_manager.listener_added`,
//! `listener.[__1]_10000.foo`) that the prometheus data model cannot carry
//! directly, so the canonical values live here and are translated into a
//! prometheus-compatible snapshot on export.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;
use prometheus::{core::Collector, IntCounter, IntGauge};

use crate::metrics;

/// A monotonically increasing counter.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge tracking a set cardinality or similar instantaneous value.
#[derive(Clone, Debug, Default)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Shared store of all counters and gauges, addressable by full dotted name.
///
/// Cloning is shallow; all clones observe the same values.
#[derive(Clone, Debug, Default)]
pub struct StatsStore {
    counters: Arc<DashMap<String, Counter>>,
    gauges: Arc<DashMap<String, Gauge>>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter registered under `name`, creating it at zero on
    /// first use.
    pub fn counter(&self, name: &str) -> Counter {
        self.counters.entry(name.to_owned()).or_default().clone()
    }

    /// Returns the gauge registered under `name`, creating it at zero on
    /// first use.
    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauges.entry(name.to_owned()).or_default().clone()
    }

    /// The current value of `name`, or zero if it was never touched.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.value().value()).unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> u64 {
        self.gauges.get(name).map(|g| g.value().value()).unwrap_or(0)
    }

    /// Creates a scope that prefixes every stat with `prefix` + `.`.
    pub fn scope(&self, prefix: impl Into<String>) -> Scope {
        Scope {
            store: self.clone(),
            prefix: prefix.into(),
        }
    }

    /// Snapshots the store into prometheus metric families, sanitizing the
    /// dotted names into the prometheus charset.
    pub fn prometheus_families(&self) -> Vec<prometheus::proto::MetricFamily> {
        let mut families = Vec::new();

        for entry in self.counters.iter() {
            let opts = metrics::opts(&sanitize_metric_name(entry.key()), "", entry.key());
            if let Ok(counter) = IntCounter::with_opts(opts) {
                counter.inc_by(entry.value().value());
                families.extend(counter.collect());
            }
        }

        for entry in self.gauges.iter() {
            let opts = metrics::opts(&sanitize_metric_name(entry.key()), "", entry.key());
            if let Ok(gauge) = IntGauge::with_opts(opts) {
                gauge.set(entry.value().value() as i64);
                families.extend(gauge.collect());
            }
        }

        families
    }
}

/// A named subtree of a [`StatsStore`].
///
/// Every listener owns one, keyed by its sanitized address, and user filters
/// publish their stats through it.
#[derive(Clone, Debug)]
pub struct Scope {
    store: StatsStore,
    prefix: String,
}

impl Scope {
    pub fn counter(&self, name: &str) -> Counter {
        self.store.counter(&self.join(name))
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.store.gauge(&self.join(name))
    }

    pub fn scope(&self, prefix: &str) -> Scope {
        self.store.scope(self.join(prefix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn join(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }
}

fn sanitize_metric_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | ':' => c,
            _ => '_',
        })
        .collect();

    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_shared_and_monotonic() {
        let store = StatsStore::new();
        let a = store.counter("listener_manager.listener_added");
        let b = store.counter("listener_manager.listener_added");

        a.inc();
        b.inc();

        assert_eq!(store.counter_value("listener_manager.listener_added"), 2);
        assert_eq!(store.counter_value("listener_manager.listener_removed"), 0);
    }

    #[test]
    fn scopes_join_with_dots() {
        let store = StatsStore::new();
        let scope = store.scope("listener.[__1]_10000");
        scope.counter("foo").inc();

        assert_eq!(store.counter_value("listener.[__1]_10000.foo"), 1);
    }

    #[test]
    fn gauges_follow_set() {
        let store = StatsStore::new();
        let gauge = store.gauge("listener_manager.total_listeners_active");
        gauge.set(3);
        gauge.set(1);

        assert_eq!(store.gauge_value("listener_manager.total_listeners_active"), 1);
    }

    #[test]
    fn prometheus_export_sanitizes_names() {
        let store = StatsStore::new();
        store.counter("listener.[__1]_10000.foo").inc();

        let families = store.prometheus_families();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_name(), "gangway_listener____1__10000_foo");
        // The original dotted path is preserved as the help string.
        assert_eq!(families[0].get_help(), "listener.[__1]_10000.foo");
    }
}
