//! Minimal metrics facade.
//!
//! The metric emission pipeline is an external collaborator; the core only
//! assumes `record(name, value)` and `timestamp(event)`. The default sink
//! writes structured tracing events so a collector can scrape them.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

pub trait Metrics: Send + Sync {
    fn record(&self, name: &str, value: i64);
    fn timestamp(&self, event: &str);
}

/// Tracing-backed sink.
#[derive(Debug, Clone, Default)]
pub struct LogMetrics;

impl Metrics for LogMetrics {
    fn record(&self, name: &str, value: i64) {
        tracing::info!(event = "grid.metric", metric = name, value, "metric");
    }

    fn timestamp(&self, event: &str) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
            .unwrap_or(0);
        tracing::info!(event = "grid.metric.tstmp", metric = event, tstmp_ms = now_ms, "timestamp");
    }
}

/// Named counters accumulated over one unit of work (a sweep, a submission)
/// and flushed to a [`Metrics`] sink at the end.
#[derive(Debug, Default)]
pub struct EventsCounter {
    counters: Mutex<HashMap<String, i64>>,
}

impl EventsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, by: i64) {
        let mut counters = self.counters.lock().expect("events counter poisoned");
        *counters.entry(name.to_string()).or_insert(0) += by;
    }

    pub fn get(&self, name: &str) -> i64 {
        self.counters
            .lock()
            .expect("events counter poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn flush(&self, sink: &dyn Metrics) {
        let counters = self.counters.lock().expect("events counter poisoned");
        for (name, value) in counters.iter() {
            sink.record(name, *value);
        }
    }
}
