//! Bucketed histograms for wait-time distributions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Buckets (in seconds) for how long units stay parked.
pub const PENDING_WAIT_BUCKETS: &[f64] = &[
    0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0,
];

/// A cumulative histogram.
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    // f64 bits
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(name: &'static str, buckets: &[f64]) -> Self {
        let mut buckets = buckets.to_vec();
        buckets.sort_by(f64::total_cmp);
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            name,
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        for (upper, counter) in self.buckets.iter().zip(&self.bucket_counts) {
            if value <= *upper {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observe a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of histogram data.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds.
    pub buckets: Vec<f64>,
    /// Count of observations <= each bound.
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Smallest bucket bound holding at least `p` percent of observations.
    pub fn percentile_bound(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = (self.count as f64 * p / 100.0).ceil() as u64;
        self.buckets
            .iter()
            .zip(&self.bucket_counts)
            .find(|(_, count)| **count >= target)
            .map(|(bound, _)| *bound)
            .unwrap_or(f64::INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::with_buckets("pending_wait", &[0.01, 0.1, 1.0]);

        hist.observe(0.005);
        hist.observe(0.05);
        hist.observe(0.5);
        hist.observe(5.0);

        let snapshot = hist.snapshot();
        assert_eq!(snapshot.count, 4);
        assert!((snapshot.sum - 5.555).abs() < 0.001);
        assert_eq!(snapshot.bucket_counts, vec![1, 2, 3]);
    }

    #[test]
    fn test_percentile_bound() {
        let hist = Histogram::with_buckets("pending_wait", &[1.0, 10.0, 100.0]);
        for i in 1..=100 {
            hist.observe(i as f64);
        }

        let snapshot = hist.snapshot();
        assert_eq!(snapshot.percentile_bound(5.0), 10.0);
        assert_eq!(snapshot.percentile_bound(99.0), 100.0);
        assert!((snapshot.mean() - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_above_all_buckets() {
        let hist = Histogram::with_buckets("pending_wait", &[1.0]);
        hist.observe(2.0);
        assert!(hist.snapshot().percentile_bound(50.0).is_infinite());
    }
}
