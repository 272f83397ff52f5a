use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use nudge_core::AnalyticsSink;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram; older ones fall out of the percentiles.
pub const HISTOGRAM_WINDOW: usize = 1024;

const ANALYTICS_EVENTS: &str = "analytics.events";
const REVIEW_CONFIDENCE: &str = "review.confidence";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one series. Histograms report their p50.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    /// Every observation ever made, including those outside the window.
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    /// Labels are sorted so their order at the call site does not matter.
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

#[derive(Default)]
struct Window {
    recent: VecDeque<f64>,
    count: u64,
    sum: f64,
}

impl Window {
    fn push(&mut self, value: f64) {
        if self.recent.len() == HISTOGRAM_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
        self.count += 1;
        self.sum += value;
    }

    fn summary(&self) -> HistogramSummary {
        if self.recent.is_empty() {
            return HistogramSummary::default();
        }
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let at = |q: f64| sorted[((sorted.len() as f64 * q) as usize).min(sorted.len() - 1)];
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

enum Series {
    Counter(AtomicU64),
    /// f64 bits.
    Gauge(AtomicU64),
    Histogram(Mutex<Window>),
}

impl Series {
    fn metric_type(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Histogram(_) => MetricType::Histogram,
        }
    }

    fn value(&self) -> f64 {
        match self {
            Self::Counter(c) => c.load(Ordering::Relaxed) as f64,
            Self::Gauge(g) => f64::from_bits(g.load(Ordering::Relaxed)),
            Self::Histogram(h) => h.lock().summary().p50,
        }
    }
}

/// Thread-safe in-memory metrics for the review engine.
///
/// Also an [`AnalyticsSink`]: each event bumps `analytics.events{event=...}`
/// and a numeric `confidence` in the payload is observed into
/// `review.confidence`.
///
/// A name/label pair belongs to the first metric type it is used with;
/// updates through another type are ignored.
#[derive(Default)]
pub struct MetricsRecorder {
    series: RwLock<HashMap<SeriesKey, Series>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.with_series(name, labels, || Series::Counter(AtomicU64::new(0)), |s| {
            if let Series::Counter(c) = s {
                c.fetch_add(n, Ordering::Relaxed);
            }
        });
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_series(name, labels, || Series::Gauge(AtomicU64::new(0)), |s| {
            if let Series::Gauge(g) = s {
                g.store(value.to_bits(), Ordering::Relaxed);
            }
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.with_series(name, labels, || Series::Histogram(Mutex::default()), |s| {
            if let Series::Histogram(h) = s {
                h.lock().push(value);
            }
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Counter(c)) => c.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Gauge(g)) => f64::from_bits(g.load(Ordering::Relaxed)),
            _ => 0.0,
        }
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Histogram(h)) => h.lock().summary(),
            _ => HistogramSummary::default(),
        }
    }

    /// Every series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut out: Vec<MetricSample> = self
            .series
            .read()
            .iter()
            .map(|(key, series)| MetricSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: series.value(),
                metric_type: series.metric_type(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }

    /// Run `update` on an existing series under the read lock, creating it
    /// with `init` under the write lock only on first use.
    fn with_series(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        init: impl FnOnce() -> Series,
        update: impl FnOnce(&Series),
    ) {
        let key = SeriesKey::new(name, labels);
        {
            let series = self.series.read();
            if let Some(s) = series.get(&key) {
                update(s);
                return;
            }
        }
        let mut series = self.series.write();
        update(series.entry(key).or_insert_with(init));
    }
}

impl AnalyticsSink for MetricsRecorder {
    fn record(&self, event: &str, payload: serde_json::Value) {
        self.counter_inc(ANALYTICS_EVENTS, &[("event", event)], 1);
        if let Some(confidence) = payload.get("confidence").and_then(|v| v.as_f64()) {
            self.histogram_observe(REVIEW_CONFIDENCE, &[], confidence);
        }
    }
}
