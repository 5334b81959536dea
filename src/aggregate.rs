//! Summary statistics over one batch of parsed records

use crate::{
    error::StateError,
    metric::{Metrics, NumericMetric},
};
use log::warn;

/// Status classes that are counted, in output order.
pub const STATUS_CLASSES: [&str; 4] = ["2xx", "3xx", "4xx", "5xx"];

/// Percentiles reported for latency samples.
pub const PERCENTILES: [u32; 3] = [90, 95, 99];

/// One classified input record, usually one log line.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParsedRecord {
    /// HTTP status code
    pub status: u16,
    /// Request time in seconds, if the format has it
    pub latency: Option<f64>,
}

/// How percentiles are picked from a small set of samples.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PercentileMethod {
    /// The smallest sample with at least p% of all samples at or below
    /// it: rank `ceil(p / 100 * n)`.
    #[default]
    NearestRank,
    /// Linear interpolation between the two closest ranks, at position
    /// `(n - 1) * p / 100`.
    Interpolated,
}

/// Counts and samples collected from one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedBatch {
    counts: [u64; 4],
    total: u64,
    samples: Vec<f64>,
}

impl AggregatedBatch {
    /// Count one record. Statuses outside 200-599 can not be put in
    /// any class and are refused.
    pub fn add(&mut self, record: ParsedRecord) -> Result<(), StateError> {
        let class = match record.status {
            200..=599 => usize::from(record.status / 100 - 2),
            other => return Err(StateError::record(format!("status {} has no class", other))),
        };
        self.counts[class] += 1;
        self.total += 1;
        if let Some(latency) = record.latency.filter(|l| l.is_finite()) {
            self.samples.push(latency);
        }
        Ok(())
    }

    /// Number of counted records
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Count for a class label like "4xx"
    pub fn count(&self, class: &str) -> Option<u64> {
        STATUS_CLASSES
            .iter()
            .position(|c| *c == class)
            .map(|i| self.counts[i])
    }

    /// Latency samples in the order seen
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Turn the batch into metrics.
    ///
    /// Counts are always there. Percentages only if anything was
    /// counted, average and percentiles only if there were samples: a
    /// missing key means "no data", which is different from zero.
    pub fn into_metrics(self, method: PercentileMethod) -> Metrics {
        let mut ret = Metrics::new();
        ret.insert(
            String::from("total_count"),
            NumericMetric::Float64(self.total as f64),
        );
        for (class, count) in STATUS_CLASSES.iter().zip(self.counts) {
            ret.insert(
                format!("{}_count", class),
                NumericMetric::Float64(count as f64),
            );
        }
        if self.total > 0 {
            let total = self.total as f64;
            for (class, count) in STATUS_CLASSES.iter().zip(self.counts) {
                ret.insert(
                    format!("{}_percentage", class),
                    NumericMetric::Float64(count as f64 * 100.0 / total),
                );
            }
        }
        if let Some(avg) = mean(&self.samples) {
            ret.insert(String::from("average"), NumericMetric::Float64(avg));
            let mut sorted = self.samples;
            sorted.sort_by(|a, b| a.total_cmp(b));
            for p in PERCENTILES {
                if let Some(v) = percentile_sorted(&sorted, f64::from(p), method) {
                    ret.insert(format!("{}_percentile", p), NumericMetric::Float64(v));
                }
            }
        }
        ret
    }
}

/// Fold records into a batch. Records that failed to parse, or that
/// can not be classified, are skipped with a warning.
pub fn aggregate<I>(records: I) -> AggregatedBatch
where
    I: IntoIterator<Item = Result<ParsedRecord, StateError>>,
{
    let mut batch = AggregatedBatch::default();
    for record in records {
        if let Err(e) = record.and_then(|r| batch.add(r)) {
            warn!("Skipping record: {}", e);
        }
    }
    batch
}

/// Arithmetic mean, None for no samples
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// The `p`th percentile (0 < p <= 100) of `samples`, None for no
/// samples or a `p` out of range.
pub fn percentile(samples: &[f64], p: f64, method: PercentileMethod) -> Option<f64> {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, p, method)
}

fn percentile_sorted(sorted: &[f64], p: f64, method: PercentileMethod) -> Option<f64> {
    let n = sorted.len();
    if n == 0 || !(p > 0.0 && p <= 100.0) {
        return None;
    }
    if n == 1 {
        return Some(sorted[0]);
    }
    match method {
        PercentileMethod::NearestRank => {
            let rank = (p / 100.0 * n as f64).ceil() as usize;
            Some(sorted[rank.clamp(1, n) - 1])
        }
        PercentileMethod::Interpolated => {
            let pos = (n - 1) as f64 * p / 100.0;
            let lower = pos.floor() as usize;
            let upper = pos.ceil() as usize;
            let frac = pos - lower as f64;
            Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
        }
    }
}
