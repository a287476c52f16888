use serde::{Deserialize, Serialize};

/// A histogram of ratio samples with logarithmic buckets.
///
/// Samples are clamped to `[lower_bound, upper_bound]`. Bucket `i` covers
/// `[lower_bound * step^i, lower_bound * step^(i + 1))` where `step = 1 + precision`.
/// Quantiles are reported at the upper edge of the bucket, so the estimate never
/// falls below the samples it summarizes by more than the precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDigest {
    lower_bound: f64,
    upper_bound: f64,
    default_value: f64,
    step: f64,
    buckets: Vec<u64>,
    sample_count: u64,
}

impl LogDigest {
    pub fn new(lower_bound: f64, upper_bound: f64, default_value: f64, precision: f64) -> Self {
        let step = 1.0 + precision;
        let bucket_count = ((upper_bound / lower_bound).ln() / step.ln()).ceil() as usize + 1;
        Self {
            lower_bound,
            upper_bound,
            default_value,
            step,
            buckets: vec![0; bucket_count],
            sample_count: 0,
        }
    }

    pub fn add_sample(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let value = value.clamp(self.lower_bound, self.upper_bound);
        let bucket = ((value / self.lower_bound).ln() / self.step.ln()).floor() as usize;
        let bucket = bucket.min(self.buckets.len() - 1);
        self.buckets[bucket] += 1;
        self.sample_count += 1;
    }

    pub fn lower_bound(&self) -> f64 {
        self.lower_bound
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn quantile(&self, q: f64) -> f64 {
        if self.sample_count == 0 {
            return self.default_value;
        }
        let target = (q.clamp(0.0, 1.0) * self.sample_count as f64).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (i, count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= target {
                let edge = self.lower_bound * self.step.powi(i as i32 + 1);
                return edge.min(self.upper_bound);
            }
        }
        self.upper_bound
    }
}
