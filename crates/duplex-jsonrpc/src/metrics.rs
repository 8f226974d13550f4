//! Per-server metrics: named counters and high-water marks.
//!
//! A collector can be shared across servers through the server options; by
//! default each server creates its own. Updates take a short mutex, never
//! held across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<HashMap<String, i64>>,
    max_values: Mutex<HashMap<String, i64>>,
}

/// A point-in-time copy of the collector, sorted for stable output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, i64>,
    pub max_values: BTreeMap<String, i64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to the named counter, creating it at zero if needed.
    pub fn count(&self, name: &str, n: i64) {
        let mut counters = self.counters.lock().expect("metrics lock poisoned");
        *counters.entry(name.to_string()).or_insert(0) += n;
    }

    /// Records `value` as the named high-water mark if it exceeds the
    /// current one.
    pub fn set_max(&self, name: &str, value: i64) {
        let mut maxes = self.max_values.lock().expect("metrics lock poisoned");
        let entry = maxes.entry(name.to_string()).or_insert(value);
        if value > *entry {
            *entry = value;
        }
    }

    /// Counter update and high-water mark in one call, for values that are
    /// both cumulative and peak-tracked (e.g. bytes per frame).
    pub fn count_and_set_max(&self, name: &str, n: i64) {
        self.count(name, n);
        self.set_max(&format!("max_{name}"), n);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.lock().expect("metrics lock poisoned");
        let max_values = self.max_values.lock().expect("metrics lock poisoned");
        MetricsSnapshot {
            counters: counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            max_values: max_values.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}
