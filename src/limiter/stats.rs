//! Per-limiter metric counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

const METRIC_COUNT: usize = 10;

/// Metrics tracked by every limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Calls that entered the limiter
    Request,
    /// Calls that passed every check and ran
    Admitted,
    /// Admitted calls whose wrapped call succeeded
    Success,
    /// Admitted calls whose wrapped call returned an error
    Failure,
    /// Checks that could not be evaluated
    Exception,
    ConcurrentExceed,
    RateExceed,
    RequestExceed,
    /// Total wrapped-call time
    ElapsedMs,
    /// Slowest wrapped call
    MaxElapsedMs,
}

impl Metric {
    pub const ALL: [Metric; METRIC_COUNT] = [
        Metric::Request,
        Metric::Admitted,
        Metric::Success,
        Metric::Failure,
        Metric::Exception,
        Metric::ConcurrentExceed,
        Metric::RateExceed,
        Metric::RequestExceed,
        Metric::ElapsedMs,
        Metric::MaxElapsedMs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Request => "request",
            Metric::Admitted => "admitted",
            Metric::Success => "success",
            Metric::Failure => "failure",
            Metric::Exception => "exception",
            Metric::ConcurrentExceed => "concurrent_exceed",
            Metric::RateExceed => "rate_exceed",
            Metric::RequestExceed => "request_exceed",
            Metric::ElapsedMs => "elapsed_ms",
            Metric::MaxElapsedMs => "max_elapsed_ms",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Default)]
struct Counters {
    values: [AtomicU64; METRIC_COUNT],
}

impl Counters {
    fn add(&self, metric: Metric, amount: u64) {
        self.values[metric.index()].fetch_add(amount, Ordering::Relaxed);
    }

    fn max(&self, metric: Metric, value: u64) {
        self.values[metric.index()].fetch_max(value, Ordering::Relaxed);
    }

    fn get(&self, metric: Metric) -> u64 {
        self.values[metric.index()].load(Ordering::Relaxed)
    }

    fn take(&self, metric: Metric) -> u64 {
        self.values[metric.index()].swap(0, Ordering::Relaxed)
    }
}

/// Two sets of counters: a cumulative one read by [`LimiterStats::statistics`]
/// and a collection window drained by [`LimiterStats::collect`].
#[derive(Debug, Default)]
pub struct LimiterStats {
    window: Counters,
    total: Counters,
}

impl LimiterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, metric: Metric) {
        self.window.add(metric, 1);
        self.total.add(metric, 1);
    }

    pub fn record_elapsed(&self, elapsed_ms: u64) {
        for counters in [&self.window, &self.total] {
            counters.add(Metric::ElapsedMs, elapsed_ms);
            counters.max(Metric::MaxElapsedMs, elapsed_ms);
        }
    }

    /// Cumulative value of one metric.
    pub fn get(&self, metric: Metric) -> u64 {
        self.total.get(metric)
    }

    /// Non-zero counters accumulated since the previous collect, resetting
    /// the collection window.
    pub fn collect(&self) -> BTreeMap<String, u64> {
        Metric::ALL
            .iter()
            .map(|m| (m.name().to_string(), self.window.take(*m)))
            .filter(|(_, v)| *v > 0)
            .collect()
    }

    /// Non-zero cumulative counters.
    pub fn statistics(&self) -> BTreeMap<String, u64> {
        Metric::ALL
            .iter()
            .map(|m| (m.name().to_string(), self.total.get(*m)))
            .filter(|(_, v)| *v > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats_are_empty_maps() {
        let stats = LimiterStats::new();
        assert!(stats.collect().is_empty());
        assert!(stats.statistics().is_empty());
    }

    #[test]
    fn test_record_counts_both_windows() {
        let stats = LimiterStats::new();
        stats.record(Metric::Request);
        stats.record(Metric::Request);
        stats.record(Metric::RateExceed);

        let stats_map = stats.statistics();
        assert_eq!(stats_map.get("request"), Some(&2));
        assert_eq!(stats_map.get("rate_exceed"), Some(&1));
        assert!(!stats_map.contains_key("success"));
        assert_eq!(stats.get(Metric::Request), 2);
    }

    #[test]
    fn test_collect_resets_window_only() {
        let stats = LimiterStats::new();
        stats.record(Metric::Success);

        assert_eq!(stats.collect().get("success"), Some(&1));
        assert!(stats.collect().is_empty());

        // Cumulative counters survive collection
        assert_eq!(stats.statistics().get("success"), Some(&1));
    }

    #[test]
    fn test_metric_names_are_unique() {
        let mut names: Vec<&str> = Metric::ALL.iter().map(Metric::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), METRIC_COUNT);
        assert!(names.contains(&"admitted"));
    }

    #[test]
    fn test_elapsed_sum_and_max() {
        let stats = LimiterStats::new();
        stats.record_elapsed(5);
        stats.record_elapsed(20);
        stats.record_elapsed(3);

        let map = stats.statistics();
        assert_eq!(map.get("elapsed_ms"), Some(&28));
        assert_eq!(map.get("max_elapsed_ms"), Some(&20));
    }
}
