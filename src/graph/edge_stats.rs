use crate::utils::{amount_to_f64, finite_or_zero};
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// Aggregate of every transfer seen between one ordered pair of addresses.
///
/// `weight` stays in fixed precision. Mean and variance are tracked with Welford's
/// single-pass update over the per-transfer amounts converted at the analysis boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeStats {
    pub weight: U256,
    pub count: u64,
    mean: f64,
    m2: f64,
    pub first_seen: u64,
    pub last_seen: u64,
}

impl EdgeStats {
    pub fn new(amount: U256, timestamp: u64) -> Self {
        Self {
            weight: amount,
            count: 1,
            mean: amount_to_f64(amount),
            m2: 0.0,
            first_seen: timestamp,
            last_seen: timestamp,
        }
    }

    pub fn record(&mut self, amount: U256, timestamp: u64) {
        self.weight = self.weight.saturating_add(amount);
        self.count += 1;

        let x = amount_to_f64(amount);
        let delta = x - self.mean;
        self.mean = finite_or_zero(self.mean + delta / self.count as f64);
        self.m2 = finite_or_zero(self.m2 + delta * (x - self.mean));

        self.first_seen = self.first_seen.min(timestamp);
        self.last_seen = self.last_seen.max(timestamp);
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; zero for an edge with a single transfer.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        finite_or_zero(self.m2 / (self.count - 1) as f64)
    }

    pub fn weight_f64(&self) -> f64 {
        amount_to_f64(self.weight)
    }

    /// Rebuilds stats from persisted parts, used when reading a snapshot back.
    pub(crate) fn from_parts(weight: U256, count: u64, mean: f64, variance: f64, first_seen: u64, last_seen: u64) -> Self {
        let m2 = if count < 2 { 0.0 } else { finite_or_zero(variance * (count - 1) as f64) };
        Self { weight, count, mean: finite_or_zero(mean), m2, first_seen, last_seen }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_sample_variance_is_zero() {
        let stats = EdgeStats::new(U256::from(10), 100);
        assert_eq!(stats.variance(), 0.0);
        assert!(!stats.variance().is_nan());
        assert_eq!(stats.mean(), 10.0);
    }

    #[test]
    fn test_welford_matches_two_pass() {
        let amounts = [4u64, 7, 13, 16];
        let mut stats = EdgeStats::new(U256::from(amounts[0]), 1);
        for (i, amount) in amounts.iter().enumerate().skip(1) {
            stats.record(U256::from(*amount), 1 + i as u64);
        }

        let mean = amounts.iter().sum::<u64>() as f64 / amounts.len() as f64;
        let variance = amounts.iter().map(|a| (*a as f64 - mean).powi(2)).sum::<f64>() / (amounts.len() - 1) as f64;

        assert_eq!(stats.weight, U256::from(40));
        assert_eq!(stats.count, 4);
        assert!((stats.mean() - mean).abs() < 1e-9);
        assert!((stats.variance() - variance).abs() < 1e-9);
        assert_eq!(stats.first_seen, 1);
        assert_eq!(stats.last_seen, 4);
    }

    #[test]
    fn test_weight_saturates() {
        let mut stats = EdgeStats::new(U256::MAX, 1);
        stats.record(U256::from(1), 2);
        assert_eq!(stats.weight, U256::MAX);
    }

    #[test]
    fn test_from_parts_restores_variance() {
        let mut stats = EdgeStats::new(U256::from(2), 1);
        stats.record(U256::from(4), 2);
        let restored = EdgeStats::from_parts(stats.weight, stats.count, stats.mean(), stats.variance(), 1, 2);
        assert!((restored.variance() - stats.variance()).abs() < 1e-12);
    }
}
