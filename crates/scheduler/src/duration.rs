use std::collections::HashMap;
use std::time::Duration;

/// Per-function task duration estimates.
///
/// Each observation moves the estimate by `alpha` toward the new sample
/// (exponential moving average). Functions never seen before are assumed to
/// take `default`.
#[derive(Debug, Clone)]
pub struct DurationEstimator {
    alpha: f64,
    default: Duration,
    estimates: HashMap<String, Duration>,
}

impl DurationEstimator {
    pub fn new(alpha: f64, default: Duration) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            default,
            estimates: HashMap::new(),
        }
    }

    pub fn estimate(&self, function: &str) -> Duration {
        self.estimates.get(function).copied().unwrap_or(self.default)
    }

    pub fn observe(&mut self, function: &str, sample: Duration) {
        let next = match self.estimates.get(function) {
            None => sample,
            Some(prev) => {
                let prev = prev.as_secs_f64();
                let cur = sample.as_secs_f64();
                Duration::from_secs_f64(prev + self.alpha * (cur - prev))
            }
        };
        self.estimates.insert(function.to_string(), next);
    }

    pub fn is_known(&self, function: &str) -> bool {
        self.estimates.contains_key(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_function_uses_default() {
        let est = DurationEstimator::new(0.5, Duration::from_millis(500));
        assert_eq!(est.estimate("anything"), Duration::from_millis(500));
        assert!(!est.is_known("anything"));
    }

    #[test]
    fn first_sample_is_taken_as_is() {
        let mut est = DurationEstimator::new(0.5, Duration::from_millis(500));
        est.observe("inc", Duration::from_millis(10));
        assert_eq!(est.estimate("inc"), Duration::from_millis(10));
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut est = DurationEstimator::new(0.5, Duration::from_millis(500));
        est.observe("inc", Duration::from_millis(100));
        est.observe("inc", Duration::from_millis(200));
        let ms = est.estimate("inc").as_millis();
        assert!((145..=155).contains(&ms), "expected ~150ms, got {ms}ms");
    }
}
